//! Execgate - a reverse proxy that execs its backends on demand
//!
//! This library provides a reverse-proxy handler that:
//! - Lazily spawns a supervised backend subprocess on the first matching request
//! - Proxies HTTP traffic to the backend over TCP or a Unix domain socket
//! - Deduplicates backends by a fingerprint of the effective configuration,
//!   so concurrent first requests start exactly one process
//! - Waits for backend readiness (connect probe plus optional HTTP check)
//!   before forwarding traffic
//! - Tracks in-flight requests and terminates idle backends after a timeout
//! - Restarts crashed backends on the next request
//! - Optionally consults an external discovery program per request to decide
//!   what to start and where to proxy
//! - Kills the whole backend process group on timeout or host shutdown

pub mod config;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod key;
pub mod lifecycle;
pub mod placeholder;
pub mod probe;
pub mod proxy;
pub mod runner;
pub mod server;
pub mod upstream;
