//! A transparent logging proxy for NETCONF over SSH.
//!
//! The binary in `main.rs` wires the pieces together; everything else lives
//! here so the integration tests can drive a proxy in-process.

pub mod capture;
pub mod config;
pub mod framer;
pub mod proxy;
pub mod relay;
pub mod rules;
