pub mod config;
pub mod fleet;
pub mod mqtt;
pub mod persistence;
