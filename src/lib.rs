//! Wormgate - A tunnel endpoint that exposes local services under leased host names
//!
//! This library provides:
//! - A registry of short-lived host leases, each bound to a unique local port
//! - An HTTP front end that routes requests by Host header to the leased port
//! - URI, header and redirect rewriting between the public name and the local service
//! - A line-oriented control protocol for creating, renewing, removing and listing leases
//! - Periodic reclamation of expired leases

pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod rewrite;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
