//! loadmeter -- network load generator and measurement client.
//!
//! Drives bursts, rate-controlled streams and bulk transfers against a test
//! server, measures latency and jitter, and samples CPU/RAM of the local
//! process and named server processes while traffic flows.

pub mod config;
pub mod device;
pub mod latency;
pub mod load;
pub mod probes;
pub mod report;
pub mod resources;
pub mod suite;
pub mod throughput;
