//! Hookbot service library crate.
//!
//! # Purpose
//! Exposes the service subsystems (config, HTTP surface, observability,
//! token minting) for use by the hookbot binary and integration tests.
//!
//! # Notes
//! The broadcast engine itself lives in `hookbot-broker`; this crate is the
//! HTTP/WebSocket skin around it.
pub mod config;
pub mod http;
pub mod observability;
pub mod publish;
pub mod subscribe;
pub mod tokens;
