//! Kernel statistics collector for illumos.
//!
//! This module provides the schema-driven kstat collection engine, with
//! support for mocking so it can be tested on any platform.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CollectorRegistry                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  KstatCollector                     │    │
//! │  │  - plan: modules → groups → counters + descriptors  │    │
//! │  │  - InstanceWalker: probe 0, 1, 2 … until not found  │    │
//! │  └──────────────────────────┬──────────────────────────┘    │
//! │                             │                               │
//! │                     ┌───────▼───────┐                       │
//! │                     │  KstatSource  │ (trait)               │
//! │                     └───────┬───────┘                       │
//! └─────────────────────────────┼───────────────────────────────┘
//!                               │
//!               ┌───────────────┼───────────────┐
//!               │               │               │
//!        ┌──────▼──────┐ ┌──────▼──────┐ ┌──────▼──────┐
//!        │  RealKstat  │ │  MockKstat  │ │  Scenarios  │
//!        │  (illumos)  │ │  (Testing)  │ │ (Fixtures)  │
//!        └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! # Usage
//!
//! ## Production (illumos)
//!
//! ```ignore
//! use kstat_core::collector::{KstatCollector, RealKstat, DEFAULT_NAMESPACE};
//! use kstat_core::schema::Schema;
//!
//! let schema = Schema::load("config/kstat.yml")?;
//! let collector = KstatCollector::new(RealKstat::new(), &schema, DEFAULT_NAMESPACE);
//! let (samples, summary) = collector.scrape()?;
//! ```
//!
//! ## Testing (with MockKstat)
//!
//! ```
//! use kstat_core::collector::{KstatCollector, MockKstat, DEFAULT_NAMESPACE};
//! use kstat_core::schema::Schema;
//!
//! let schema = Schema::from_yaml_str(
//!     "kstat_modules: [{id: cpu, kstat_names: [{id: sys, kstat_stats: [{id: syscall}]}]}]",
//! )
//! .unwrap();
//! let collector = KstatCollector::new(MockKstat::with_cpus(2), &schema, DEFAULT_NAMESPACE);
//! let (samples, _) = collector.scrape().unwrap();
//! assert_eq!(samples.len(), 4);
//! ```

pub mod descriptor;
mod engine;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
mod illumos;
pub mod mock;
mod registry;
pub mod traits;

pub use descriptor::{Descriptor, DescriptorSet};
pub use engine::{
    CollectError, DEFAULT_NAMESPACE, GroupSummary, KstatCollector, MAX_INSTANCES, ScrapeSummary,
    StatFailure, StatPath,
};
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub use illumos::{RealKstat, RealSession};
pub use mock::MockKstat;
pub use registry::{CollectorOutcome, CollectorRegistry, Gathered, MetricCollector, RegistryError};
pub use traits::{
    KstatEntry, KstatSession, KstatSource, SourceError, StructuredKind, StructuredStats, Vminfo,
};
