//! In-memory kstat chain for testing collectors without illumos.
//!
//! `MockKstat` stores kstats the way `kc_chain` would present them, counts
//! every call made through its sessions, and can inject failures at each
//! level the collector has to survive.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::collector::traits::{
    KstatEntry, KstatSession, KstatSource, SourceError, StructuredKind, StructuredStats, Vminfo,
};
use crate::schema::GroupPattern;

/// Value of a mocked named statistic.
#[derive(Debug, Clone, PartialEq)]
pub enum MockValue {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    /// Reading this statistic fails with an I/O error.
    Broken,
}

#[derive(Debug, Clone)]
struct MockEntry {
    module: String,
    instance: u32,
    name: String,
    snaptime: i64,
    stats: Vec<(String, MockValue)>,
    /// Reading this kstat fails with an I/O error.
    unreadable: bool,
}

#[derive(Debug, Clone, Default)]
struct MockData {
    /// Kstats in chain order.
    entries: Vec<MockEntry>,
    vminfo: Option<(Vminfo, i64)>,
    unavailable: bool,
}

/// Call counters shared by a `MockKstat` and all of its sessions.
#[derive(Debug, Default)]
pub struct MockCalls {
    opens: AtomicUsize,
    closes: AtomicUsize,
    lookups: AtomicUsize,
    structured: AtomicUsize,
}

impl MockCalls {
    /// Sessions opened successfully.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Sessions dropped.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Calls to `lookup`.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Calls to `structured`.
    pub fn structured(&self) -> usize {
        self.structured.load(Ordering::SeqCst)
    }
}

/// In-memory kstat source.
#[derive(Debug, Clone, Default)]
pub struct MockKstat {
    data: Arc<MockData>,
    calls: Arc<MockCalls>,
}

impl MockKstat {
    /// Creates an empty kstat chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source whose `open` always fails.
    pub fn unavailable() -> Self {
        let mut mock = Self::new();
        Arc::make_mut(&mut mock.data).unavailable = true;
        mock
    }

    /// Adds a named kstat with unsigned statistics.
    ///
    /// # Arguments
    /// * `module` - kstat module, e.g. `cpu`
    /// * `instance` - instance number
    /// * `name` - kstat name, e.g. `sys`
    /// * `snaptime` - refresh time in nanoseconds
    /// * `stats` - statistic names and values
    pub fn add_kstat(
        &mut self,
        module: &str,
        instance: u32,
        name: &str,
        snaptime: i64,
        stats: &[(&str, u64)],
    ) {
        Arc::make_mut(&mut self.data).entries.push(MockEntry {
            module: module.to_string(),
            instance,
            name: name.to_string(),
            snaptime,
            stats: stats
                .iter()
                .map(|(k, v)| (k.to_string(), MockValue::Unsigned(*v)))
                .collect(),
            unreadable: false,
        });
    }

    /// Sets or replaces one statistic of an existing kstat.
    ///
    /// Does nothing if the kstat has not been added.
    pub fn set_value(
        &mut self,
        module: &str,
        instance: u32,
        name: &str,
        stat: &str,
        value: MockValue,
    ) {
        let data = Arc::make_mut(&mut self.data);
        let Some(entry) = data
            .entries
            .iter_mut()
            .find(|e| e.module == module && e.instance == instance && e.name == name)
        else {
            return;
        };

        match entry.stats.iter_mut().find(|(k, _)| k == stat) {
            Some((_, v)) => *v = value,
            None => entry.stats.push((stat.to_string(), value)),
        }
    }

    /// Makes every read of an existing kstat fail.
    ///
    /// Does nothing if the kstat has not been added.
    pub fn set_unreadable(&mut self, module: &str, instance: u32, name: &str) {
        let data = Arc::make_mut(&mut self.data);
        if let Some(entry) = data
            .entries
            .iter_mut()
            .find(|e| e.module == module && e.instance == instance && e.name == name)
        {
            entry.unreadable = true;
        }
    }

    /// Installs the `unix:0:vminfo` struct.
    pub fn set_vminfo(&mut self, vminfo: Vminfo, snaptime: i64) {
        Arc::make_mut(&mut self.data).vminfo = Some((vminfo, snaptime));
    }

    /// Returns the call counters.
    pub fn calls(&self) -> &MockCalls {
        &self.calls
    }
}

impl KstatSource for MockKstat {
    type Session = MockSession;

    fn open(&self) -> Result<MockSession, SourceError> {
        if self.data.unavailable {
            return Err(SourceError::Unavailable(io::Error::new(
                io::ErrorKind::NotFound,
                "/dev/kstat not present",
            )));
        }

        self.calls.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            data: Arc::clone(&self.data),
            calls: Arc::clone(&self.calls),
        })
    }
}

/// Session over a `MockKstat`. Counts as closed when dropped.
#[derive(Debug)]
pub struct MockSession {
    data: Arc<MockData>,
    calls: Arc<MockCalls>,
}

impl KstatSession for MockSession {
    fn lookup(
        &mut self,
        module: &str,
        instance: u32,
        group: &GroupPattern,
    ) -> Result<Vec<KstatEntry>, SourceError> {
        self.calls.lookups.fetch_add(1, Ordering::SeqCst);

        let found: Vec<KstatEntry> = self
            .data
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.module == module && e.instance == instance && group.is_match(&e.name))
            .map(|(slot, e)| KstatEntry::new(&e.module, e.instance, &e.name, 0, slot))
            .collect();

        if found.is_empty() {
            return Err(SourceError::NotFound {
                module: module.to_string(),
                instance,
                group: group.to_string(),
            });
        }
        Ok(found)
    }

    fn read(&mut self, entry: &mut KstatEntry) -> Result<(), SourceError> {
        let kstat = self.data.entries.get(entry.slot).ok_or_else(|| SourceError::NotFound {
            module: entry.module.clone(),
            instance: entry.instance,
            group: entry.name.clone(),
        })?;

        if kstat.unreadable {
            return Err(SourceError::Read(io::Error::other(format!(
                "{}:{}:{} is unreadable",
                kstat.module, kstat.instance, kstat.name
            ))));
        }
        entry.snaptime = kstat.snaptime;
        Ok(())
    }

    fn named_value(&mut self, entry: &KstatEntry, stat: &str) -> Result<u64, SourceError> {
        let kstat = self
            .data
            .entries
            .get(entry.slot)
            .ok_or_else(|| SourceError::MissingStat(stat.to_string()))?;

        let (_, value) = kstat
            .stats
            .iter()
            .find(|(k, _)| k == stat)
            .ok_or_else(|| SourceError::MissingStat(stat.to_string()))?;

        match value {
            MockValue::Unsigned(v) => Ok(*v),
            MockValue::Signed(v) => u64::try_from(*v).map_err(|_| SourceError::OutOfRange {
                stat: stat.to_string(),
                value: *v,
            }),
            MockValue::Text(_) => Err(SourceError::UnsupportedType {
                stat: stat.to_string(),
                data_type: 9,
            }),
            MockValue::Broken => Err(SourceError::Read(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("{} vanished during read", stat),
            ))),
        }
    }

    fn structured(&mut self, kind: StructuredKind) -> Result<StructuredStats, SourceError> {
        self.calls.structured.fetch_add(1, Ordering::SeqCst);

        match kind {
            StructuredKind::Vminfo => match self.data.vminfo {
                Some((data, snaptime)) => Ok(StructuredStats::Vminfo { data, snaptime }),
                None => Err(SourceError::Read(io::Error::new(
                    io::ErrorKind::NotFound,
                    "unix:0:vminfo not present",
                ))),
            },
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
    }
}
