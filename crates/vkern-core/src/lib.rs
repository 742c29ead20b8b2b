//! Core primitives shared by the vkern crates.
//!
//! This crate provides:
//! - Severity-levelled log channels and the injectable [`LogSink`] capability
//! - The [`KernelObject`] lifecycle trait implemented by kernel-owned resources
//! - A `tracing` subscriber helper for hosts that do not install their own

pub mod lifecycle;
pub mod log;

pub use lifecycle::KernelObject;
pub use log::{init_tracing, CaptureSink, LogChannel, LogSink, NullSink, TracingSink};
