pub mod analytics;
pub mod attendance;
pub mod audit_log;
pub mod backup_exchange;
pub mod core;
pub mod events;
pub mod incidents;
pub mod sessions;
pub mod students;
pub mod transfers;
pub mod users;
