pub mod server;
pub mod update;
