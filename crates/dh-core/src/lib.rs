pub mod artifacts;
pub mod config;
pub mod cooldown;
pub mod crypto;
pub mod types;
