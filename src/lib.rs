//! High-throughput proxy endpoint validation with egress IP intelligence.
//!
//! The engine streams candidate endpoints from a file into a bounded queue,
//! probes each one over HTTP, TLS-wrapped HTTP CONNECT and SOCKS5, confirms
//! real egress by fetching an IP-intelligence document through the tunnel,
//! and writes one line per working (endpoint, protocol, credential) triple.
//! A resource sampler throttles the pool under memory or descriptor
//! pressure.

pub mod admission;
pub mod app;
pub mod cdn;
pub mod classify;
pub mod cli;
pub mod dial;
pub mod endpoint;
pub mod ipinfo;
pub mod parse;
pub mod platform;
pub mod probe;
pub mod stats;
pub mod track;
pub mod worker;
