//! Transport implementations.
//!
//! The only in-tree transport is [`loopback`] — a bounded in-process
//! queue pair joining two simulated cores. A silicon build would add an
//! MMIO-backed implementation of the same trait here.

pub mod loopback;

pub use loopback::LoopbackTransport;
