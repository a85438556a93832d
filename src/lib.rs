//! DualQ Coupled AQM (RFC 9332 DualPI2) queue discipline, packaged as an
//! emulation cell: a classifier feeding Classic and L4S sub-queues, a PI²
//! probability controller, a weighted deficit round-robin scheduler and a
//! staging reconciler for link layers that dequeue in aggregated batches.

pub mod cells;
pub mod error;
