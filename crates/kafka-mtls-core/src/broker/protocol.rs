//! Kafka API versions and error codes used by this client.
//!
//! All versions are non-flexible so every response carries a v0 header.

/// Metadata request/response version.
pub const METADATA_VERSION: i16 = 8;

/// ListOffsets request/response version.
pub const LIST_OFFSETS_VERSION: i16 = 5;

/// Fetch request/response version.
pub const FETCH_VERSION: i16 = 11;

/// Produce request/response version.
pub const PRODUCE_VERSION: i16 = 8;

/// ListOffsets timestamp selecting the earliest retained offset.
pub const EARLIEST_TIMESTAMP: i64 = -2;

/// ListOffsets timestamp selecting the next offset to be written.
pub const LATEST_TIMESTAMP: i64 = -1;

/// Replica ID sent by ordinary (non-broker) clients.
pub const CONSUMER_REPLICA_ID: i32 = -1;

/// Broker error codes this client reacts to.
pub mod error_codes {
    pub const NONE: i16 = 0;
    pub const OFFSET_OUT_OF_RANGE: i16 = 1;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const FENCED_LEADER_EPOCH: i16 = 74;
    pub const UNKNOWN_LEADER_EPOCH: i16 = 75;

    /// Errors that mean the cached partition leader is stale.
    #[must_use]
    pub fn is_stale_leader(code: i16) -> bool {
        matches!(
            code,
            UNKNOWN_TOPIC_OR_PARTITION
                | LEADER_NOT_AVAILABLE
                | NOT_LEADER_OR_FOLLOWER
                | FENCED_LEADER_EPOCH
                | UNKNOWN_LEADER_EPOCH
        )
    }
}

#[cfg(test)]
mod tests {
    use super::error_codes::*;

    #[test]
    fn test_stale_leader_codes() {
        assert!(is_stale_leader(NOT_LEADER_OR_FOLLOWER));
        assert!(is_stale_leader(LEADER_NOT_AVAILABLE));
        assert!(!is_stale_leader(NONE));
        assert!(!is_stale_leader(OFFSET_OUT_OF_RANGE));
        assert!(!is_stale_leader(REQUEST_TIMED_OUT));
    }
}
