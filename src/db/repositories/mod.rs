pub mod pending_sessions;
pub mod records;
