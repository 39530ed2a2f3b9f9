pub mod config;
pub mod sandbox;
