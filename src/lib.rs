//! Library crate for svcscan-rs exposing reusable modules.
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod session;
pub mod tls;
pub mod types;
