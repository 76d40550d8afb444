//! Utopia Scale - a multi-process scaling toolkit for HTTP services
//!
//! This library provides three interlocking capabilities:
//! - Supervises a fixed-size pool of worker server processes bound to
//!   adjacent TCP ports, handed their role through an environment-variable
//!   handshake and restarted when they exit
//! - Distributes incoming HTTP traffic across the workers through a reverse
//!   proxy with pluggable selection strategies and live connection accounting
//! - Offloads CPU-intensive callbacks to a bounded pool of long-lived
//!   compute executors with inline fallback under saturation

pub mod balancer;
pub mod compute;
pub mod config;
pub mod error;
pub mod handshake;
pub mod proxy;
pub mod supervisor;
pub mod worker;
