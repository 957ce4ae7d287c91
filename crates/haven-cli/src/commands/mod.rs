pub mod deploy;
pub mod diagnose;
pub mod server;
pub mod watch;
