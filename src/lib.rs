// Factorio Fleet - manage headless Factorio servers on one host

pub mod commands;
pub mod servers;
pub mod settings;
pub mod updater;
