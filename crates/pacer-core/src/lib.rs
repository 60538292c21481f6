pub mod config;
pub mod tokens;
pub mod types;
