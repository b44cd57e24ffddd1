/// Owner references are PostgreSQL BIGINT user ids.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Submitter-assigned job identifier. Usually a GUID, but any non-empty
/// string is accepted.
pub type JobGuid = String;

/// Result identifiers are generated by the consumer.
pub type ResultGuid = uuid::Uuid;
