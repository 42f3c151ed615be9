//! Schema-driven kstat collection.
//!
//! `KstatCollector` turns a [`Schema`] into an immutable collection plan at
//! construction time and walks it on every scrape:
//!
//! ```text
//! for module in schema order
//!   for group in module order
//!     structured group ──► one struct read, label "0"
//!     named group      ──► Probe(0) ─found─► read, emit ─► Probe(1) ─► ...
//!                              ├─failed─► log ─────────────► Probe(1)
//!                              └─not found─► Exhausted
//! ```
//!
//! Only a failure to open the kstat session aborts a scrape. A missing
//! counter, instance or struct is logged and the walk moves on.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::collector::descriptor::{Descriptor, DescriptorSet};
use crate::collector::traits::{
    KstatEntry, KstatSession, KstatSource, SourceError, StructuredKind, StructuredStats,
};
use crate::metric::{Sample, SampleSink, scale_value};
use crate::schema::{Group, GroupPattern, Schema};

/// Namespace prefixed to every metric name by default.
pub const DEFAULT_NAMESPACE: &str = "node";

/// Upper bound on probed instances per group.
pub const MAX_INSTANCES: u32 = 65_536;

/// Label value used for single-instance structured kstats.
const STRUCTURED_INSTANCE: &str = "0";

/// Error that aborts a whole scrape.
#[derive(Debug)]
pub enum CollectError {
    /// The kstat session could not be opened.
    Open(SourceError),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Open(e) => write!(f, "cannot open kstat session: {}", e),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Open(e) => Some(e),
        }
    }
}

/// Address of a statistic, displayed as `module:instance:group:counter`.
///
/// `counter` is empty when a whole instance or group failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatPath {
    pub module: String,
    pub instance: u32,
    pub group: String,
    pub counter: String,
}

impl std::fmt::Display for StatPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.module, self.instance, self.group, self.counter
        )
    }
}

/// A per-unit failure absorbed during a scrape.
#[derive(Debug)]
pub struct StatFailure {
    pub path: StatPath,
    pub cause: SourceError,
}

/// Instances found for one configured group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub module: String,
    pub group: String,
    pub instances: u32,
}

/// Outcome of one scrape.
#[derive(Debug, Default)]
pub struct ScrapeSummary {
    pub duration: Duration,
    /// Number of samples emitted.
    pub samples: usize,
    pub failures: Vec<StatFailure>,
    pub groups: Vec<GroupSummary>,
}

/// How a group is read, with the descriptors it emits under.
#[derive(Debug)]
enum Route {
    /// Named group with a literal id; one descriptor set for every instance.
    Literal(DescriptorSet),
    /// Named group with a pattern id. Sets are built per concrete kstat name
    /// on first sight and kept for later instances and scrapes.
    Pattern(Mutex<HashMap<String, DescriptorSet>>),
    Structured {
        kind: StructuredKind,
        descriptors: DescriptorSet,
    },
}

#[derive(Debug)]
struct ModulePlan {
    id: String,
    groups: Vec<GroupPlan>,
}

#[derive(Debug)]
struct GroupPlan {
    group: Group,
    route: Route,
}

impl GroupPlan {
    /// Descriptors for the concrete kstat `name` of a named group.
    fn descriptors(&self, namespace: &str, module: &str, name: &str) -> Cow<'_, DescriptorSet> {
        match &self.route {
            Route::Literal(set) | Route::Structured { descriptors: set, .. } => Cow::Borrowed(set),
            Route::Pattern(cache) => {
                let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
                let set = cache
                    .entry(name.to_string())
                    .or_insert_with(|| DescriptorSet::build(namespace, module, name, &self.group));
                Cow::Owned(set.clone())
            }
        }
    }
}

/// Collector for the kstats described by a schema.
pub struct KstatCollector<S: KstatSource> {
    source: S,
    namespace: String,
    modules: Vec<ModulePlan>,
}

impl<S: KstatSource> KstatCollector<S> {
    /// Creates a collector and precomputes all descriptors.
    ///
    /// # Arguments
    /// * `source` - kstat source (real or mock)
    /// * `schema` - loaded schema, copied into the collection plan
    /// * `namespace` - metric name prefix, usually [`DEFAULT_NAMESPACE`]
    pub fn new(source: S, schema: &Schema, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();

        let modules = schema
            .modules
            .iter()
            .map(|module| ModulePlan {
                id: module.id.clone(),
                groups: module
                    .groups
                    .iter()
                    .map(|group| plan_group(&namespace, &module.id, group))
                    .collect(),
            })
            .collect();

        Self {
            source,
            namespace,
            modules,
        }
    }

    /// Returns the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs one scrape, emitting samples into `sink` in traversal order.
    ///
    /// # Returns
    /// A summary of the scrape, or `CollectError::Open` if the kstat session
    /// could not be opened. Per-counter failures are reported in the summary.
    pub fn collect(&self, sink: &mut dyn SampleSink) -> Result<ScrapeSummary, CollectError> {
        let start = Instant::now();
        let mut session = self.source.open().map_err(CollectError::Open)?;

        let mut scrape = Scrape {
            sink,
            summary: ScrapeSummary::default(),
        };

        for module in &self.modules {
            for plan in &module.groups {
                match &plan.route {
                    Route::Structured { kind, descriptors } => self.collect_structured(
                        &mut session,
                        &module.id,
                        plan,
                        *kind,
                        descriptors,
                        &mut scrape,
                    ),
                    Route::Literal(_) | Route::Pattern(_) => {
                        self.collect_named(&mut session, &module.id, plan, &mut scrape)
                    }
                }
            }
        }

        drop(session);

        let mut summary = scrape.summary;
        summary.duration = start.elapsed();
        debug!(
            "kstat scrape: {} samples, {} failures in {:?}",
            summary.samples,
            summary.failures.len(),
            summary.duration
        );
        Ok(summary)
    }

    /// Runs one scrape and returns the samples.
    pub fn scrape(&self) -> Result<(Vec<Sample>, ScrapeSummary), CollectError> {
        let mut samples = Vec::new();
        let summary = self.collect(&mut samples)?;
        Ok((samples, summary))
    }

    fn collect_named(
        &self,
        session: &mut S::Session,
        module: &str,
        plan: &GroupPlan,
        scrape: &mut Scrape<'_>,
    ) {
        let mut walker = InstanceWalker::new(module, &plan.group.pattern);
        let mut instances = 0;

        loop {
            match walker.step(session) {
                Step::Found { instance, entries } => {
                    instances += 1;
                    let label = instance.to_string();
                    for entry in entries {
                        self.emit_entry(session, module, plan, entry, &label, scrape);
                    }
                }
                Step::Exhausted => break,
                Step::Failed { instance, cause } => scrape.fail(
                    StatPath {
                        module: module.to_string(),
                        instance,
                        group: plan.group.id().to_string(),
                        counter: String::new(),
                    },
                    cause,
                ),
            }
        }

        scrape.summary.groups.push(GroupSummary {
            module: module.to_string(),
            group: plan.group.id().to_string(),
            instances,
        });
    }

    fn emit_entry(
        &self,
        session: &mut S::Session,
        module: &str,
        plan: &GroupPlan,
        mut entry: KstatEntry,
        label: &str,
        scrape: &mut Scrape<'_>,
    ) {
        if let Err(cause) = session.read(&mut entry) {
            scrape.fail(
                StatPath {
                    module: module.to_string(),
                    instance: entry.instance,
                    group: entry.name,
                    counter: String::new(),
                },
                cause,
            );
            return;
        }

        let set = plan.descriptors(&self.namespace, module, &entry.name);

        for (counter, desc) in plan.group.counters.iter().zip(&set.counters) {
            match session.named_value(&entry, &counter.id) {
                Ok(raw) => scrape.emit(desc, label, scale_value(raw, counter.scale)),
                Err(cause) => scrape.fail(
                    StatPath {
                        module: module.to_string(),
                        instance: entry.instance,
                        group: entry.name.clone(),
                        counter: counter.id.clone(),
                    },
                    cause,
                ),
            }
        }

        let snaptime = session.snapshot_time(&entry);
        scrape.emit(&set.snaptime, label, snaptime as f64);
    }

    fn collect_structured(
        &self,
        session: &mut S::Session,
        module: &str,
        plan: &GroupPlan,
        kind: StructuredKind,
        set: &DescriptorSet,
        scrape: &mut Scrape<'_>,
    ) {
        let path = |counter: &str| StatPath {
            module: module.to_string(),
            instance: 0,
            group: kind.name().to_string(),
            counter: counter.to_string(),
        };

        let stats: StructuredStats = match session.structured(kind) {
            Ok(stats) => stats,
            Err(cause) => {
                scrape.fail(path(""), cause);
                scrape.summary.groups.push(GroupSummary {
                    module: module.to_string(),
                    group: plan.group.id().to_string(),
                    instances: 0,
                });
                return;
            }
        };

        for (counter, desc) in plan.group.counters.iter().zip(&set.counters) {
            match stats.get(&counter.id) {
                Some(raw) => scrape.emit(desc, STRUCTURED_INSTANCE, scale_value(raw, counter.scale)),
                None => scrape.fail(
                    path(&counter.id),
                    SourceError::MissingStat(counter.id.clone()),
                ),
            }
        }
        scrape.emit(&set.snaptime, STRUCTURED_INSTANCE, stats.snaptime() as f64);

        scrape.summary.groups.push(GroupSummary {
            module: module.to_string(),
            group: plan.group.id().to_string(),
            instances: 1,
        });
    }
}

fn plan_group(namespace: &str, module: &str, group: &Group) -> GroupPlan {
    let route = if let Some(kind) = StructuredKind::route(module, &group.pattern) {
        Route::Structured {
            kind,
            descriptors: DescriptorSet::build(namespace, module, kind.name(), group),
        }
    } else if let Some(name) = group.pattern.literal() {
        Route::Literal(DescriptorSet::build(namespace, module, name, group))
    } else {
        Route::Pattern(Mutex::new(HashMap::new()))
    };

    GroupPlan {
        group: group.clone(),
        route,
    }
}

/// Per-scrape emission state.
struct Scrape<'a> {
    sink: &'a mut dyn SampleSink,
    summary: ScrapeSummary,
}

impl Scrape<'_> {
    fn emit(&mut self, desc: &Arc<Descriptor>, label: &str, value: f64) {
        self.sink.emit(Sample::new(Arc::clone(desc), label, value));
        self.summary.samples += 1;
    }

    fn fail(&mut self, path: StatPath, cause: SourceError) {
        error!("{}: {}", path, cause);
        self.summary.failures.push(StatFailure { path, cause });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    Probe(u32),
    Exhausted,
}

/// Result of one walker step.
#[derive(Debug)]
enum Step {
    Found {
        instance: u32,
        entries: Vec<KstatEntry>,
    },
    /// Lookup reported not-found; enumeration is complete.
    Exhausted,
    /// Lookup failed for another reason; enumeration goes on with the next
    /// instance.
    Failed { instance: u32, cause: SourceError },
}

/// Enumerates the instances of one group by probing 0, 1, 2, ... until the
/// first not-found lookup or `MAX_INSTANCES`.
struct InstanceWalker<'a> {
    module: &'a str,
    group: &'a GroupPattern,
    state: WalkState,
}

impl<'a> InstanceWalker<'a> {
    fn new(module: &'a str, group: &'a GroupPattern) -> Self {
        Self {
            module,
            group,
            state: WalkState::Probe(0),
        }
    }

    fn step<T: KstatSession>(&mut self, session: &mut T) -> Step {
        let WalkState::Probe(instance) = self.state else {
            return Step::Exhausted;
        };

        if instance >= MAX_INSTANCES {
            warn!(
                "{}::{} still has instances after {}, stopping enumeration",
                self.module, self.group, MAX_INSTANCES
            );
            self.state = WalkState::Exhausted;
            return Step::Exhausted;
        }

        debug!("looking up kstat {}:{}:{}", self.module, instance, self.group);
        match session.lookup(self.module, instance, self.group) {
            Ok(entries) => {
                self.state = WalkState::Probe(instance + 1);
                Step::Found { instance, entries }
            }
            Err(e) if e.is_not_found() => {
                self.state = WalkState::Exhausted;
                Step::Exhausted
            }
            Err(cause) => {
                self.state = WalkState::Probe(instance + 1);
                Step::Failed { instance, cause }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{MockKstat, MockValue};
    use crate::collector::traits::Vminfo;

    const CPU_SCHEMA: &str = "\
kstat_modules:
  - id: cpu
    kstat_names:
      - id: sys
        label_string: cpu
        kstat_stats:
          - id: syscall
            suffix: total
            scale_factor: 1
";

    fn collector(source: MockKstat, schema: &str) -> KstatCollector<MockKstat> {
        let schema = Schema::from_yaml_str(schema).unwrap();
        KstatCollector::new(source, &schema, DEFAULT_NAMESPACE)
    }

    fn rows(samples: &[Sample]) -> Vec<(String, String, String, f64)> {
        samples
            .iter()
            .map(|s| {
                (
                    s.desc.name.clone(),
                    s.desc.label.clone(),
                    s.label_value.clone(),
                    s.value,
                )
            })
            .collect()
    }

    #[test]
    fn test_cpu_sys_scenario() {
        let mut ks = MockKstat::new();
        ks.add_kstat("cpu", 0, "sys", 5_000, &[("syscall", 100)]);
        ks.add_kstat("cpu", 1, "sys", 5_001, &[("syscall", 250)]);

        let (samples, summary) = collector(ks, CPU_SCHEMA).scrape().unwrap();

        let expected: Vec<(String, String, String, f64)> = vec![
            ("node_kstat_cpu_sys_syscall_total".into(), "cpu".into(), "0".into(), 100.0),
            ("node_kstat_cpu_sys_snaptime".into(), "inst".into(), "0".into(), 5_000.0),
            ("node_kstat_cpu_sys_syscall_total".into(), "cpu".into(), "1".into(), 250.0),
            ("node_kstat_cpu_sys_snaptime".into(), "inst".into(), "1".into(), 5_001.0),
        ];
        assert_eq!(rows(&samples), expected);
        assert_eq!(summary.samples, 4);
        assert!(summary.failures.is_empty());
        assert_eq!(summary.groups[0].instances, 2);
    }

    #[test]
    fn test_descriptor_shared_across_instances() {
        let (samples, _) = collector(MockKstat::with_cpus(2), CPU_SCHEMA)
            .scrape()
            .unwrap();
        assert!(Arc::ptr_eq(&samples[0].desc, &samples[2].desc));
        assert_eq!(samples[0].desc.help, "cpu::sys:syscall");
    }

    #[test]
    fn test_scaling_law() {
        let mut ks = MockKstat::new();
        ks.add_kstat(
            "cpu",
            0,
            "sys",
            0,
            &[("cpu_nsec_user", 5_000_000_000), ("syscall", 7), ("cpu_nsec_intr", 2_450_000_000)],
        );

        let c = collector(
            ks,
            "\
kstat_modules:
  - id: cpu
    kstat_names:
      - id: sys
        kstat_stats:
          - id: cpu_nsec_user
            suffix: seconds_total
            scale_factor: 1e-9
          - id: syscall
          - id: cpu_nsec_intr
            suffix: seconds_total
            scale_factor: 1e-9
",
        );

        let (samples, _) = c.scrape().unwrap();
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        assert_eq!(values, [5.0, 7.0, 2.0, 0.0]);
        assert_eq!(samples[0].name(), "node_kstat_cpu_sys_cpu_nsec_user_seconds_total");
    }

    #[test]
    fn test_enumeration_terminates_at_first_missing_instance() {
        for n in [0u32, 1, 5] {
            let c = collector(MockKstat::with_cpus(n), CPU_SCHEMA);
            let (samples, summary) = c.scrape().unwrap();

            let syscalls: Vec<_> = samples
                .iter()
                .filter(|s| s.name() == "node_kstat_cpu_sys_syscall_total")
                .map(|s| s.label_value.clone())
                .collect();
            let expected: Vec<_> = (0..n).map(|i| i.to_string()).collect();

            assert_eq!(syscalls, expected, "n = {}", n);
            assert_eq!(summary.groups[0].instances, n);
            assert_eq!(c.source().calls().lookups(), n as usize + 1);
            assert!(summary.failures.is_empty());
        }
    }

    #[test]
    fn test_gap_in_instances_ends_enumeration() {
        let mut ks = MockKstat::new();
        ks.add_kstat("cpu", 0, "sys", 0, &[("syscall", 1)]);
        ks.add_kstat("cpu", 2, "sys", 0, &[("syscall", 3)]);

        let (_, summary) = collector(ks, CPU_SCHEMA).scrape().unwrap();
        assert_eq!(summary.groups[0].instances, 1);
    }

    #[test]
    fn test_counter_failure_is_isolated() {
        let mut ks = MockKstat::new();
        let stats = [("syscall", 10), ("sysread", 20), ("syswrite", 30)];
        ks.add_kstat("cpu", 0, "sys", 0, &stats);
        ks.add_kstat("cpu", 1, "sys", 0, &stats);
        ks.set_value("cpu", 0, "sys", "sysread", MockValue::Broken);

        let c = collector(
            ks,
            "\
kstat_modules:
  - id: cpu
    kstat_names:
      - id: sys
        kstat_stats:
          - id: syscall
          - id: sysread
          - id: syswrite
",
        );
        let (samples, summary) = c.scrape().unwrap();

        let counters_for = |inst: &str| {
            samples
                .iter()
                .filter(|s| s.label_value == inst && s.desc.label == "instance")
                .count()
        };
        assert_eq!(counters_for("0"), 2);
        assert_eq!(counters_for("1"), 3);
        assert_eq!(summary.groups[0].instances, 2);

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path.to_string(), "cpu:0:sys:sysread");
        assert!(matches!(summary.failures[0].cause, SourceError::Read(_)));
    }

    #[test]
    fn test_missing_counter_is_logged_not_fatal() {
        let c = collector(
            MockKstat::with_cpus(1),
            "\
kstat_modules:
  - id: cpu
    kstat_names:
      - id: sys
        kstat_stats:
          - id: not_in_this_kernel
          - id: syscall
",
        );
        let (samples, summary) = c.scrape().unwrap();
        assert_eq!(samples.len(), 2);
        assert!(matches!(
            summary.failures[0].cause,
            SourceError::MissingStat(ref s) if s == "not_in_this_kernel"
        ));
    }

    const VMINFO_SCHEMA: &str = "\
kstat_modules:
  - id: unix
    kstat_names:
      - id: vminfo
        kstat_stats:
          - id: freemem
            suffix: pages
          - id: swap_avail
            scale_factor: 0.5
          - id: updates
";

    #[test]
    fn test_vminfo_uses_structured_path() {
        let mut ks = MockKstat::new();
        ks.set_vminfo(
            Vminfo {
                freemem: 4096,
                swap_avail: 11,
                updates: 3,
                ..Vminfo::default()
            },
            77,
        );

        let c = collector(ks, VMINFO_SCHEMA);
        let (samples, summary) = c.scrape().unwrap();

        assert_eq!(c.source().calls().lookups(), 0);
        assert_eq!(c.source().calls().structured(), 1);

        let expected: Vec<(String, String, String, f64)> = vec![
            ("node_kstat_unix_vminfo_freemem_pages".into(), "instance".into(), "0".into(), 4096.0),
            ("node_kstat_unix_vminfo_swap_avail_total".into(), "instance".into(), "0".into(), 5.0),
            ("node_kstat_unix_vminfo_updates_total".into(), "instance".into(), "0".into(), 3.0),
            ("node_kstat_unix_vminfo_snaptime".into(), "inst".into(), "0".into(), 77.0),
        ];
        assert_eq!(rows(&samples), expected);
        assert_eq!(summary.groups[0].instances, 1);

        c.scrape().unwrap();
        assert_eq!(c.source().calls().structured(), 2);
        assert_eq!(c.source().calls().lookups(), 0);
    }

    #[test]
    fn test_vminfo_failure_skips_only_that_group() {
        let schema = format!("{}{}", VMINFO_SCHEMA, CPU_SCHEMA.trim_start_matches("kstat_modules:\n"));
        let c = collector(MockKstat::with_cpus(2), &schema);

        let (samples, summary) = c.scrape().unwrap();

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path.to_string(), "unix:0:vminfo:");
        assert_eq!(summary.groups[0].instances, 0);
        assert_eq!(summary.groups[1].instances, 2);
        assert!(samples.iter().all(|s| !s.name().contains("vminfo")));
        assert_eq!(samples.len(), 4);
    }

    #[test]
    fn test_unknown_vminfo_field_is_logged() {
        let mut ks = MockKstat::new();
        ks.set_vminfo(Vminfo::default(), 0);
        let c = collector(
            ks,
            "\
kstat_modules:
  - id: unix
    kstat_names:
      - id: vminfo
        kstat_stats:
          - id: pgswapin
          - id: freemem
",
        );
        let (samples, summary) = c.scrape().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(summary.failures[0].path.to_string(), "unix:0:vminfo:pgswapin");
    }

    #[test]
    fn test_plan_routes_carry_their_descriptors() {
        let schema = Schema::from_yaml_str(
            "\
kstat_modules:
  - id: unix
    kstat_names:
      - id: vminfo
        kstat_stats:
          - id: freemem
      - id: system_misc
        kstat_stats:
          - id: nproc
      - id: sys.*
        kstat_stats:
          - id: nproc
",
        )
        .unwrap();
        let module = &schema.modules[0];
        let plans: Vec<_> = module
            .groups
            .iter()
            .map(|g| plan_group(DEFAULT_NAMESPACE, &module.id, g))
            .collect();

        match &plans[0].route {
            Route::Structured { kind, descriptors } => {
                assert_eq!(*kind, StructuredKind::Vminfo);
                assert_eq!(descriptors.counters[0].name, "node_kstat_unix_vminfo_freemem_total");
            }
            other => panic!("vminfo routed as {:?}", other),
        }
        match &plans[1].route {
            Route::Literal(set) => {
                assert_eq!(set.snaptime.name, "node_kstat_unix_system_misc_snaptime")
            }
            other => panic!("system_misc routed as {:?}", other),
        }
        assert!(matches!(plans[2].route, Route::Pattern(_)));
    }

    #[test]
    fn test_two_scrapes_are_identical() {
        let c = collector(MockKstat::typical_system(), include_str!("../../../../config/kstat.yml"));
        let (first, _) = c.scrape().unwrap();
        let (second, _) = c.scrape().unwrap();
        assert!(!first.is_empty());
        assert_eq!(rows(&first), rows(&second));
    }

    #[test]
    fn test_shipped_schema_against_typical_system() {
        let c = collector(MockKstat::typical_system(), include_str!("../../../../config/kstat.yml"));
        let (samples, summary) = c.scrape().unwrap();

        assert!(summary.failures.is_empty(), "{:?}", summary.failures);
        assert!(samples.iter().any(|s| s.name() == "node_kstat_unix_vminfo_freemem_pages"));
        assert_eq!(
            samples
                .iter()
                .filter(|s| s.name() == "node_kstat_cpu_sys_snaptime")
                .count(),
            4
        );
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let c = collector(MockKstat::unavailable(), CPU_SCHEMA);
        let mut sink = Vec::new();
        let err = c.collect(&mut sink).unwrap_err();
        assert!(matches!(err, CollectError::Open(SourceError::Unavailable(_))));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_session_closed_after_each_scrape() {
        let c = collector(MockKstat::with_cpus(3), CPU_SCHEMA);
        c.scrape().unwrap();
        c.scrape().unwrap();
        assert_eq!(c.source().calls().opens(), 2);
        assert_eq!(c.source().calls().closes(), 2);
    }

    #[test]
    fn test_pattern_group_emits_per_matched_name() {
        let c = collector(
            MockKstat::typical_system(),
            "\
kstat_modules:
  - id: zones
    kstat_names:
      - id: zone_misc_.*
        label_string: zoneid
        kstat_stats:
          - id: nprocs
",
        );
        let (samples, summary) = c.scrape().unwrap();

        let names: Vec<_> = samples.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(
            names,
            [
                "node_kstat_zones_zone_misc_global_nprocs_total",
                "node_kstat_zones_zone_misc_global_snaptime",
                "node_kstat_zones_zone_misc_web_nprocs_total",
                "node_kstat_zones_zone_misc_web_snaptime",
            ]
        );
        assert_eq!(samples[0].labels(), [("zoneid", "0")]);
        assert_eq!(summary.groups[0].instances, 1);
    }

    #[test]
    fn test_traversal_follows_declaration_order() {
        let c = collector(
            MockKstat::typical_system(),
            "\
kstat_modules:
  - id: zfs
    kstat_names:
      - id: arcstats
        kstat_stats:
          - id: misses
          - id: hits
  - id: unix
    kstat_names:
      - id: system_misc
        kstat_stats:
          - id: nproc
",
        );
        let (samples, _) = c.scrape().unwrap();
        let names: Vec<_> = samples.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "node_kstat_zfs_arcstats_misses_total",
                "node_kstat_zfs_arcstats_hits_total",
                "node_kstat_zfs_arcstats_snaptime",
                "node_kstat_unix_system_misc_nproc_total",
                "node_kstat_unix_system_misc_snaptime",
            ]
        );
    }

    /// Source that finds `sys` for every instance below `limit` and fails
    /// with a read error at `fail_at`.
    struct ScriptedKstat {
        limit: u32,
        fail_at: Option<u32>,
    }

    struct ScriptedSession {
        limit: u32,
        fail_at: Option<u32>,
    }

    impl KstatSource for ScriptedKstat {
        type Session = ScriptedSession;

        fn open(&self) -> Result<ScriptedSession, SourceError> {
            Ok(ScriptedSession {
                limit: self.limit,
                fail_at: self.fail_at,
            })
        }
    }

    impl KstatSession for ScriptedSession {
        fn lookup(
            &mut self,
            module: &str,
            instance: u32,
            group: &GroupPattern,
        ) -> Result<Vec<KstatEntry>, SourceError> {
            if Some(instance) == self.fail_at {
                return Err(SourceError::Read(std::io::Error::other("EIO")));
            }
            if instance >= self.limit {
                return Err(SourceError::NotFound {
                    module: module.into(),
                    instance,
                    group: group.to_string(),
                });
            }
            Ok(vec![KstatEntry::new(module, instance, group.as_str(), 0, 0)])
        }

        fn read(&mut self, _: &mut KstatEntry) -> Result<(), SourceError> {
            Ok(())
        }

        fn named_value(&mut self, _: &KstatEntry, _: &str) -> Result<u64, SourceError> {
            Ok(1)
        }

        fn structured(&mut self, _: StructuredKind) -> Result<StructuredStats, SourceError> {
            unreachable!("no structured groups in these tests")
        }
    }

    #[test]
    fn test_lookup_error_skips_only_that_instance() {
        let schema = Schema::from_yaml_str(CPU_SCHEMA).unwrap();
        let source = ScriptedKstat {
            limit: 10,
            fail_at: Some(3),
        };
        let c = KstatCollector::new(source, &schema, "");

        let (samples, summary) = c.scrape().unwrap();

        let instances: Vec<_> = samples
            .iter()
            .filter(|s| s.name() == "kstat_cpu_sys_syscall_total")
            .map(|s| s.label_value.as_str())
            .collect();
        assert_eq!(instances, ["0", "1", "2", "4", "5", "6", "7", "8", "9"]);
        assert_eq!(summary.groups[0].instances, 9);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path.to_string(), "cpu:3:sys:");
    }

    #[test]
    fn test_runaway_enumeration_is_capped() {
        let schema = Schema::from_yaml_str(CPU_SCHEMA).unwrap();
        let source = ScriptedKstat {
            limit: u32::MAX,
            fail_at: None,
        };
        let c = KstatCollector::new(source, &schema, DEFAULT_NAMESPACE);

        let mut sink = Vec::new();
        let summary = c.collect(&mut sink).unwrap();
        assert_eq!(summary.groups[0].instances, MAX_INSTANCES);
        assert!(summary.failures.is_empty());
    }

    #[test]
    fn test_walker_states() {
        let group = GroupPattern::new("sys").unwrap();
        let mut session = MockKstat::with_cpus(1).open().unwrap();
        let mut walker = InstanceWalker::new("cpu", &group);

        assert!(matches!(walker.step(&mut session), Step::Found { instance: 0, .. }));
        assert_eq!(walker.state, WalkState::Probe(1));
        assert!(matches!(walker.step(&mut session), Step::Exhausted));
        assert_eq!(walker.state, WalkState::Exhausted);
        assert!(matches!(walker.step(&mut session), Step::Exhausted));
    }

    #[test]
    fn test_walker_moves_past_failed_lookup() {
        let group = GroupPattern::new("sys").unwrap();
        let mut session = ScriptedKstat {
            limit: 2,
            fail_at: Some(0),
        }
        .open()
        .unwrap();
        let mut walker = InstanceWalker::new("cpu", &group);

        assert!(matches!(walker.step(&mut session), Step::Failed { instance: 0, .. }));
        assert_eq!(walker.state, WalkState::Probe(1));
        assert!(matches!(walker.step(&mut session), Step::Found { instance: 1, .. }));
        assert!(matches!(walker.step(&mut session), Step::Exhausted));
    }

    #[test]
    fn test_unreadable_entry_keeps_its_siblings() {
        let mut ks = MockKstat::new();
        ks.add_kstat("zones", 0, "zone_misc_global", 1, &[("nprocs", 10)]);
        ks.add_kstat("zones", 0, "zone_misc_web", 2, &[("nprocs", 20)]);
        ks.add_kstat("zones", 1, "zone_misc_global", 3, &[("nprocs", 30)]);
        ks.set_unreadable("zones", 0, "zone_misc_global");

        let c = collector(
            ks,
            "\
kstat_modules:
  - id: zones
    kstat_names:
      - id: zone_misc_.*
        kstat_stats:
          - id: nprocs
",
        );
        let (samples, summary) = c.scrape().unwrap();

        let expected: Vec<(String, String, String, f64)> = vec![
            ("node_kstat_zones_zone_misc_web_nprocs_total".into(), "instance".into(), "0".into(), 20.0),
            ("node_kstat_zones_zone_misc_web_snaptime".into(), "inst".into(), "0".into(), 2.0),
            ("node_kstat_zones_zone_misc_global_nprocs_total".into(), "instance".into(), "1".into(), 30.0),
            ("node_kstat_zones_zone_misc_global_snaptime".into(), "inst".into(), "1".into(), 3.0),
        ];
        assert_eq!(rows(&samples), expected);
        assert_eq!(summary.groups[0].instances, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path.to_string(), "zones:0:zone_misc_global:");
    }

    #[test]
    fn test_pattern_descriptors_shared_across_instances_and_scrapes() {
        let mut ks = MockKstat::new();
        ks.add_kstat("zones", 0, "zone_misc_global", 0, &[("nprocs", 1)]);
        ks.add_kstat("zones", 1, "zone_misc_global", 0, &[("nprocs", 2)]);

        let c = collector(
            ks,
            "\
kstat_modules:
  - id: zones
    kstat_names:
      - id: zone_misc_.*
        kstat_stats:
          - id: nprocs
",
        );
        let (first, _) = c.scrape().unwrap();
        let (second, _) = c.scrape().unwrap();

        assert_eq!(first.len(), 4);
        assert!(Arc::ptr_eq(&first[0].desc, &first[2].desc));
        assert!(Arc::ptr_eq(&first[1].desc, &first[3].desc));
        assert!(Arc::ptr_eq(&first[0].desc, &second[0].desc));
        assert!(Arc::ptr_eq(&first[3].desc, &second[3].desc));
    }
}
