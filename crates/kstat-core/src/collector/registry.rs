//! Explicit registry of metric collectors.
//!
//! The daemon builds a `CollectorRegistry` at startup and registers each
//! collector it wants; nothing registers itself. `gather` runs every
//! collector in registration order and adds per-collector health samples:
//!
//! - `<ns>_scrape_collector_duration_seconds{collector="..."}`
//! - `<ns>_scrape_collector_success{collector="..."}`

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::collector::descriptor::{Descriptor, build_fq_name};
use crate::collector::engine::{CollectError, KstatCollector};
use crate::collector::traits::KstatSource;
use crate::metric::{Sample, SampleSink};

/// A source of samples that can be scraped.
pub trait MetricCollector: Send + Sync {
    /// Unique collector name, used as the `collector` label value.
    fn name(&self) -> &str;

    /// Emits the collector's current samples into `sink`.
    fn update(&self, sink: &mut dyn SampleSink) -> Result<(), CollectError>;
}

impl<S: KstatSource> MetricCollector for KstatCollector<S> {
    fn name(&self) -> &str {
        "kstat"
    }

    fn update(&self, sink: &mut dyn SampleSink) -> Result<(), CollectError> {
        self.collect(sink).map(|_| ())
    }
}

/// Error type for registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A collector with this name is already registered.
    Duplicate(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Duplicate(name) => {
                write!(f, "collector {} is already registered", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Result of running one collector.
#[derive(Debug, Clone)]
pub struct CollectorOutcome {
    pub name: String,
    pub duration: Duration,
    /// Error message if the collector failed.
    pub error: Option<String>,
}

impl CollectorOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Samples and outcomes of one `gather` call.
#[derive(Debug, Default)]
pub struct Gathered {
    pub samples: Vec<Sample>,
    pub outcomes: Vec<CollectorOutcome>,
}

/// Ordered set of collectors scraped together.
pub struct CollectorRegistry {
    collectors: Vec<Box<dyn MetricCollector>>,
    duration_desc: Arc<Descriptor>,
    success_desc: Arc<Descriptor>,
}

impl CollectorRegistry {
    /// Creates an empty registry whose health metrics use `namespace`.
    pub fn new(namespace: &str) -> Self {
        Self {
            collectors: Vec::new(),
            duration_desc: Arc::new(Descriptor {
                name: build_fq_name(namespace, "scrape", "collector_duration_seconds"),
                help: "Duration of a collector scrape.".to_string(),
                label: "collector".to_string(),
            }),
            success_desc: Arc::new(Descriptor {
                name: build_fq_name(namespace, "scrape", "collector_success"),
                help: "Whether a collector succeeded.".to_string(),
                label: "collector".to_string(),
            }),
        }
    }

    /// Adds a collector after the already registered ones.
    pub fn register(&mut self, collector: Box<dyn MetricCollector>) -> Result<(), RegistryError> {
        let name = collector.name();
        if self.collectors.iter().any(|c| c.name() == name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        debug!("registered collector {}", name);
        self.collectors.push(collector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Runs every collector once.
    ///
    /// A failing collector does not affect the others; its failure shows up
    /// in the outcome and as `collector_success = 0`.
    pub fn gather(&self) -> Gathered {
        let mut gathered = Gathered::default();

        for collector in &self.collectors {
            let name = collector.name();
            let start = Instant::now();
            let result = collector.update(&mut gathered.samples);
            let duration = start.elapsed();

            let error = match result {
                Ok(()) => None,
                Err(e) => {
                    error!("collector {} failed after {:?}: {}", name, duration, e);
                    Some(e.to_string())
                }
            };

            gathered.samples.push(Sample::new(
                Arc::clone(&self.duration_desc),
                name,
                duration.as_secs_f64(),
            ));
            gathered.samples.push(Sample::new(
                Arc::clone(&self.success_desc),
                name,
                if error.is_none() { 1.0 } else { 0.0 },
            ));
            gathered.outcomes.push(CollectorOutcome {
                name: name.to_string(),
                duration,
                error,
            });
        }

        gathered
    }
}
