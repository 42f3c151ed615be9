//! kstat-core - schema-driven kernel statistics collection.
//!
//! Provides:
//! - `schema` - YAML schema of kstat modules, groups and counters
//! - `collector` - collection engine, kstat sources (real and mock), registry
//! - `metric` - samples and sinks

pub mod collector;
pub mod metric;
pub mod schema;
