//! SubjectCore Benchmarks
//!
//! This crate contains performance benchmarks for the SubjectCore engine:
//! command routing with and without the state cache, and event handling
//! throughput across partitions. The library domain from the integration
//! tests is the workload.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
