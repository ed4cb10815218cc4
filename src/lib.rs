// src/lib.rs
pub mod codec;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod stats;
