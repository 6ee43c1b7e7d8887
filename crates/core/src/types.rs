/// Job identifiers are the server node's integer primary keys.
pub type JobId = i64;
