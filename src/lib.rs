//! Frame presentation tracer.
//!
//! Correlates graphics pipeline trace events (runtime present calls, kernel
//! queue and flip packets, compositor tokens) into one completed [`Present`]
//! record per attempted frame, and aggregates them into rolling statistics.
//!
//! [`Present`]: present::Present

pub mod agent;
pub mod aggregate;
pub mod config;
pub mod engine;
pub mod export;
pub mod present;
pub mod sink;
pub mod tracer;
pub mod vr;
