pub mod admin;
pub mod fake;
pub mod journal;
pub mod network_log;
pub mod session;
