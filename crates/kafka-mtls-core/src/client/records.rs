//! Kafka record batch (magic v2) encoding and decoding.
//!
//! Only uncompressed batches are produced and read. Compressed batches and
//! legacy message sets are reported as [`ClientError::UnsupportedRecords`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ClientError, Result};

const MAGIC_V2: i8 = 2;

/// Bytes before the CRC-covered region: base offset, batch length,
/// leader epoch, magic, crc.
const BATCH_PREFIX_LEN: usize = 8 + 4 + 4 + 1 + 4;

/// Bytes from the start of the batch to the end of the batch length field.
const LOG_OVERHEAD: usize = 12;

const COMPRESSION_MASK: i16 = 0x07;
const TRANSACTIONAL_FLAG: i16 = 0x10;
const CONTROL_FLAG: i16 = 0x20;

/// A record to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: i64,
}

impl ProducerRecord {
    pub fn new(value: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            key: None,
            value: value.into(),
            timestamp,
        }
    }
}

/// A record read back from a batch, with its absolute offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// A decoded fetch record set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    pub records: Vec<Record>,
    /// Offset after the last complete batch, including control batches and
    /// batches whose records were compacted away. `None` if no batch was
    /// complete.
    pub next_offset: Option<i64>,
}

/// Encode records into a single uncompressed batch starting at `base_offset`.
#[must_use]
pub fn encode_batch(base_offset: i64, records: &[ProducerRecord]) -> Bytes {
    encode_batch_with_attributes(base_offset, records, 0)
}

/// Encode a transaction commit marker as a one-record control batch.
#[must_use]
pub fn encode_control_batch(base_offset: i64, timestamp: i64) -> Bytes {
    // key: version 0, type 1 (commit); value: version 0, coordinator epoch 0
    let mut key = BytesMut::with_capacity(4);
    key.put_i16(0);
    key.put_i16(1);
    let mut value = BytesMut::with_capacity(6);
    value.put_i16(0);
    value.put_i32(0);

    let marker = ProducerRecord {
        key: Some(key.freeze()),
        value: value.freeze(),
        timestamp,
    };
    encode_batch_with_attributes(base_offset, &[marker], CONTROL_FLAG | TRANSACTIONAL_FLAG)
}

fn encode_batch_with_attributes(
    base_offset: i64,
    records: &[ProducerRecord],
    attributes: i16,
) -> Bytes {
    let base_timestamp = records.first().map_or(0, |r| r.timestamp);
    let max_timestamp = records
        .iter()
        .map(|r| r.timestamp)
        .max()
        .unwrap_or(base_timestamp);

    // attributes .. records, covered by the CRC
    let mut body = BytesMut::new();
    body.put_i16(attributes); // never compressed, create time
    body.put_i32(records.len().saturating_sub(1) as i32); // last offset delta
    body.put_i64(base_timestamp);
    body.put_i64(max_timestamp);
    body.put_i64(-1); // producer id
    body.put_i16(-1); // producer epoch
    body.put_i32(-1); // base sequence
    body.put_i32(records.len() as i32);

    let mut record_buf = BytesMut::new();
    for (delta, record) in records.iter().enumerate() {
        record_buf.clear();
        record_buf.put_i8(0); // record attributes
        put_varint(&mut record_buf, record.timestamp - base_timestamp);
        put_varint(&mut record_buf, delta as i64);
        put_bytes(&mut record_buf, record.key.as_deref());
        put_bytes(&mut record_buf, Some(&record.value));
        put_varint(&mut record_buf, 0); // headers

        put_varint(&mut body, record_buf.len() as i64);
        body.put_slice(&record_buf);
    }

    let crc = crc32c::crc32c(&body);
    let batch_length = (BATCH_PREFIX_LEN - LOG_OVERHEAD + body.len()) as i32;

    let mut out = BytesMut::with_capacity(BATCH_PREFIX_LEN + body.len());
    out.put_i64(base_offset);
    out.put_i32(batch_length);
    out.put_i32(-1); // partition leader epoch
    out.put_i8(MAGIC_V2);
    out.put_u32(crc);
    out.put_slice(&body);
    out.freeze()
}

/// Decode every complete batch and return only the records.
///
/// # Errors
///
/// See [`decode_record_set`].
pub fn decode_batches(data: Bytes) -> Result<Vec<Record>> {
    decode_record_set(data).map(|set| set.records)
}

/// Decode every complete batch in a fetch response's record set.
///
/// A partial batch at the end of the buffer is normal (the broker cuts at
/// `max_bytes`) and is ignored. Control batches yield no records but still
/// advance [`RecordSet::next_offset`].
///
/// # Errors
///
/// Returns an error for a CRC mismatch, a malformed record, a compressed
/// batch or a pre-v2 message set.
pub fn decode_record_set(mut data: Bytes) -> Result<RecordSet> {
    let mut out = RecordSet::default();

    while data.len() >= LOG_OVERHEAD {
        let batch_length = (&data[8..12]).get_i32();
        if batch_length < 0 {
            return Err(decode_error(format!("negative batch length {batch_length}")));
        }
        let total = LOG_OVERHEAD + batch_length as usize;
        if data.len() < total {
            break;
        }
        let batch = data.split_to(total);
        let end = decode_batch(batch, &mut out.records)?;
        out.next_offset = Some(out.next_offset.map_or(end, |prev| prev.max(end)));
    }

    Ok(out)
}

/// Decode one batch into `out`, returning the offset that follows it.
fn decode_batch(mut batch: Bytes, out: &mut Vec<Record>) -> Result<i64> {
    if batch.len() < BATCH_PREFIX_LEN {
        return Err(decode_error("batch shorter than its header"));
    }

    let base_offset = batch.get_i64();
    let _batch_length = batch.get_i32();
    let _leader_epoch = batch.get_i32();
    let magic = batch.get_i8();
    if magic != MAGIC_V2 {
        return Err(ClientError::UnsupportedRecords(format!(
            "message format magic {magic}"
        )));
    }
    let expected_crc = batch.get_u32();
    let actual_crc = crc32c::crc32c(&batch);
    if expected_crc != actual_crc {
        return Err(decode_error(format!(
            "record batch CRC mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
        )));
    }

    ensure_remaining(&batch, 2 + 4 + 8 + 8 + 8 + 2 + 4 + 4)?;
    let attributes = batch.get_i16();
    let last_offset_delta = batch.get_i32();
    let base_timestamp = batch.get_i64();
    let _max_timestamp = batch.get_i64();
    let _producer_id = batch.get_i64();
    let _producer_epoch = batch.get_i16();
    let _base_sequence = batch.get_i32();
    let count = batch.get_i32();
    let end = base_offset + i64::from(last_offset_delta) + 1;

    let codec = attributes & COMPRESSION_MASK;
    if codec != 0 {
        return Err(ClientError::UnsupportedRecords(format!(
            "compression codec {codec}"
        )));
    }
    if attributes & CONTROL_FLAG != 0 {
        return Ok(end);
    }

    for _ in 0..count {
        let length = get_varint(&mut batch)?;
        let length = usize::try_from(length)
            .map_err(|_| decode_error(format!("negative record length {length}")))?;
        ensure_remaining(&batch, length)?;
        let mut record = batch.split_to(length);

        ensure_remaining(&record, 1)?;
        let _attributes = record.get_i8();
        let timestamp_delta = get_varint(&mut record)?;
        let offset_delta = get_varint(&mut record)?;
        let key = get_bytes(&mut record)?;
        let value = get_bytes(&mut record)?;
        let headers = get_varint(&mut record)?;
        for _ in 0..headers {
            let _ = get_bytes(&mut record)?;
            let _ = get_bytes(&mut record)?;
        }

        out.push(Record {
            offset: base_offset + offset_delta,
            timestamp: base_timestamp + timestamp_delta,
            key,
            value,
        });
    }

    Ok(end)
}

fn decode_error(message: impl Into<String>) -> ClientError {
    ClientError::ProtocolDecode {
        message: message.into(),
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(decode_error(format!(
            "record data truncated: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_varint(buf: &mut BytesMut, value: i64) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    while zigzag >= 0x80 {
        buf.put_u8((zigzag as u8 & 0x7f) | 0x80);
        zigzag >>= 7;
    }
    buf.put_u8(zigzag as u8);
}

fn get_varint(buf: &mut Bytes) -> Result<i64> {
    let mut raw: u64 = 0;
    for shift in (0..64).step_by(7) {
        ensure_remaining(buf, 1)?;
        let byte = buf.get_u8();
        raw |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((raw >> 1) as i64 ^ -((raw & 1) as i64));
        }
    }
    Err(decode_error("varint longer than 10 bytes"))
}

fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            put_varint(buf, v.len() as i64);
            buf.put_slice(v);
        }
        None => put_varint(buf, -1),
    }
}

fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    let len = get_varint(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    ensure_remaining(buf, len)?;
    Ok(Some(buf.split_to(len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(values: &[&str]) -> Vec<ProducerRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ProducerRecord::new(Bytes::from(v.to_string()), 1_700_000_000_000 + i as i64))
            .collect()
    }

    #[test]
    fn test_batch_offsets_and_values() {
        let batch = encode_batch(40, &sample(&["a", "bb", "ccc"]));
        let records = decode_batches(batch).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![40, 41, 42]
        );
        assert_eq!(records[2].value.as_deref(), Some(&b"ccc"[..]));
        assert_eq!(records[1].timestamp, 1_700_000_000_001);
        assert!(records[0].key.is_none());
    }

    #[test]
    fn test_consecutive_batches() {
        let mut data = BytesMut::new();
        data.extend_from_slice(&encode_batch(0, &sample(&["first"])));
        data.extend_from_slice(&encode_batch(1, &sample(&["second", "third"])));

        let records = decode_batches(data.freeze()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].offset, 2);
    }

    #[test]
    fn test_trailing_partial_batch_ignored() {
        let mut data = BytesMut::new();
        data.extend_from_slice(&encode_batch(0, &sample(&["whole"])));
        let second = encode_batch(1, &sample(&["cut off"]));
        data.extend_from_slice(&second[..second.len() - 3]);

        let records = decode_batches(data.freeze()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_empty_record_set() {
        assert!(decode_batches(Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn test_crc_mismatch() {
        let mut data = BytesMut::from(&encode_batch(0, &sample(&["payload"]))[..]);
        let last = data.len() - 2;
        data[last] ^= 0xff;
        assert!(matches!(
            decode_batches(data.freeze()),
            Err(ClientError::ProtocolDecode { .. })
        ));
    }

    #[test]
    fn test_compressed_batch_rejected() {
        let mut data = BytesMut::from(&encode_batch(0, &sample(&["payload"]))[..]);
        // set gzip and fix up the CRC
        data[BATCH_PREFIX_LEN + 1] |= 0x01;
        let crc = crc32c::crc32c(&data[BATCH_PREFIX_LEN..]);
        data[BATCH_PREFIX_LEN - 4..BATCH_PREFIX_LEN].copy_from_slice(&crc.to_be_bytes());

        assert!(matches!(
            decode_batches(data.freeze()),
            Err(ClientError::UnsupportedRecords(_))
        ));
    }

    #[test]
    fn test_legacy_magic_rejected() {
        let mut data = BytesMut::from(&encode_batch(0, &sample(&["payload"]))[..]);
        data[16] = 1;
        assert!(matches!(
            decode_batches(data.freeze()),
            Err(ClientError::UnsupportedRecords(_))
        ));
    }

    #[test]
    fn test_control_batch_skipped() {
        let mut data = BytesMut::from(&encode_batch(0, &sample(&["marker"]))[..]);
        data[BATCH_PREFIX_LEN + 1] |= CONTROL_FLAG as u8;
        let crc = crc32c::crc32c(&data[BATCH_PREFIX_LEN..]);
        data[BATCH_PREFIX_LEN - 4..BATCH_PREFIX_LEN].copy_from_slice(&crc.to_be_bytes());

        assert!(decode_batches(data.freeze()).unwrap().is_empty());
    }

    #[test]
    fn test_next_offset_covers_whole_batches() {
        let set = decode_record_set(encode_batch(40, &sample(&["a", "bb", "ccc"]))).unwrap();
        assert_eq!(set.records.len(), 3);
        assert_eq!(set.next_offset, Some(43));

        assert_eq!(decode_record_set(Bytes::new()).unwrap().next_offset, None);
    }

    #[test]
    fn test_control_batch_at_tail_advances_position() {
        let mut data = BytesMut::new();
        data.extend_from_slice(&encode_batch(7, &sample(&["value"])));
        data.extend_from_slice(&encode_control_batch(8, 1_700_000_000_000));

        let set = decode_record_set(data.freeze()).unwrap();
        assert_eq!(set.records.len(), 1);
        assert_eq!(set.records[0].offset, 7);
        assert_eq!(set.next_offset, Some(9));
    }

    #[test]
    fn test_lone_control_batch_yields_position_only() {
        let set = decode_record_set(encode_control_batch(12, 0)).unwrap();
        assert!(set.records.is_empty());
        assert_eq!(set.next_offset, Some(13));
    }

    #[test]
    fn test_partial_batch_does_not_advance_position() {
        let whole = encode_batch(3, &sample(&["cut off"]));
        let set = decode_record_set(whole.slice(..whole.len() - 1)).unwrap();
        assert_eq!(set, RecordSet::default());
    }

    proptest! {
        #[test]
        fn varint_survives_any_value(value in any::<i64>()) {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            prop_assert!(buf.len() <= 10);
            let mut bytes = buf.freeze();
            prop_assert_eq!(get_varint(&mut bytes).unwrap(), value);
            prop_assert!(bytes.is_empty());
        }

        #[test]
        fn decoder_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_batches(Bytes::from(data));
        }
    }
}
