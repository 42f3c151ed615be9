//! Metric descriptors derived from the schema.
//!
//! Names are built as `<namespace>_kstat_<module>_<group>_<stat>` where
//! `<stat>` is `<counter>_<suffix>` for ordinary counters and `snaptime` for
//! the synthetic snapshot-time counter. Building is pure: the same inputs
//! always yield equal descriptors.

use std::sync::Arc;

use crate::schema::{Counter, Group};

/// Statistic name of the synthetic snapshot-time counter.
pub const SNAPTIME: &str = "snaptime";

/// Label name of the snapshot-time metric.
pub const SNAPTIME_LABEL: &str = "inst";

/// Immutable identity of a metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub name: String,
    pub help: String,
    /// Name of the single label carried by the series.
    pub label: String,
}

impl Descriptor {
    /// Descriptor for a configured counter of `module::group`.
    pub fn for_counter(
        namespace: &str,
        module: &str,
        group: &str,
        counter: &Counter,
        label: &str,
    ) -> Self {
        Self {
            name: build_fq_name(
                namespace,
                &subsystem(module, group),
                &stat_name(&counter.id, &counter.suffix),
            ),
            help: counter.help.clone(),
            label: label.to_string(),
        }
    }

    /// Descriptor for the snapshot time of `module::group`.
    pub fn for_snaptime(namespace: &str, module: &str, group: &str) -> Self {
        Self {
            name: build_fq_name(namespace, &subsystem(module, group), SNAPTIME),
            help: format!("{}::{}:{}", module, group, SNAPTIME),
            label: SNAPTIME_LABEL.to_string(),
        }
    }
}

/// Descriptors for every counter of one concrete group, snapshot time last.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    pub counters: Vec<Arc<Descriptor>>,
    pub snaptime: Arc<Descriptor>,
}

impl DescriptorSet {
    /// Builds descriptors for `group` as it appears under `group_name`.
    ///
    /// `group_name` is the concrete kstat name; for literal groups it equals
    /// the configured id.
    pub fn build(namespace: &str, module: &str, group_name: &str, group: &Group) -> Self {
        Self {
            counters: group
                .counters
                .iter()
                .map(|c| {
                    Arc::new(Descriptor::for_counter(
                        namespace,
                        module,
                        group_name,
                        c,
                        &group.label,
                    ))
                })
                .collect(),
            snaptime: Arc::new(Descriptor::for_snaptime(namespace, module, group_name)),
        }
    }
}

fn subsystem(module: &str, group: &str) -> String {
    format!(
        "kstat_{}_{}",
        hyphen_to_underscore(module),
        hyphen_to_underscore(group)
    )
}

fn stat_name(id: &str, suffix: &str) -> String {
    format!("{}_{}", hyphen_to_underscore(id), suffix)
}

/// Joins the non-empty parts with `_`.
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

fn hyphen_to_underscore(s: &str) -> String {
    s.replace('-', "_")
}
