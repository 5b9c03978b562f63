pub mod bridge;
pub mod config;
pub mod engine;
pub mod environment;
pub mod errors;
pub mod homeassistant;
pub mod mqtt;
pub mod tibber;
pub mod timeline;
pub mod trackers;
