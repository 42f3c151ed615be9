//! Abstractions over the kernel statistics interface.
//!
//! The `KstatSource` trait lets the collector run against the real `libkstat`
//! on illumos and against an in-memory mock everywhere else, including CI.

use crate::schema::GroupPattern;

/// Error type for kstat source operations.
#[derive(Debug)]
pub enum SourceError {
    /// The statistics interface could not be opened.
    Unavailable(std::io::Error),
    /// No kstat matches the requested module, instance and group.
    NotFound {
        module: String,
        instance: u32,
        group: String,
    },
    /// The kstat has no statistic with this name.
    MissingStat(String),
    /// The statistic is not numeric.
    UnsupportedType { stat: String, data_type: u8 },
    /// A signed statistic holds a negative value.
    OutOfRange { stat: String, value: i64 },
    /// Reading the kstat data failed.
    Read(std::io::Error),
}

impl SourceError {
    /// Returns `true` for the lookup miss that ends instance enumeration.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Unavailable(e) => write!(f, "kstat unavailable: {}", e),
            SourceError::NotFound {
                module,
                instance,
                group,
            } => write!(f, "no kstat {}:{}:{}", module, instance, group),
            SourceError::MissingStat(stat) => write!(f, "no statistic named {}", stat),
            SourceError::UnsupportedType { stat, data_type } => {
                write!(f, "statistic {} has non-numeric type {}", stat, data_type)
            }
            SourceError::OutOfRange { stat, value } => {
                write!(f, "statistic {} is negative ({})", stat, value)
            }
            SourceError::Read(e) => write!(f, "kstat read failed: {}", e),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Read(e)
    }
}

/// One kstat found by [`KstatSession::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KstatEntry {
    pub module: String,
    pub instance: u32,
    /// Concrete kstat name (the group id for literal groups).
    pub name: String,
    /// High-resolution time of the last data refresh, in nanoseconds.
    pub snaptime: i64,
    /// Source-specific handle, only meaningful to the session that created it.
    pub(crate) slot: usize,
}

impl KstatEntry {
    pub fn new(
        module: impl Into<String>,
        instance: u32,
        name: impl Into<String>,
        snaptime: i64,
        slot: usize,
    ) -> Self {
        Self {
            module: module.into(),
            instance,
            name: name.into(),
            snaptime,
            slot,
        }
    }
}

/// Kstats that expose a fixed C struct instead of named values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredKind {
    /// `unix:0:vminfo`, system-wide virtual memory counters.
    Vminfo,
}

impl StructuredKind {
    /// Returns the structured kind served for `module::group`, if any.
    pub fn route(module: &str, group: &GroupPattern) -> Option<Self> {
        if module == "unix" && group.is_match("vminfo") {
            Some(StructuredKind::Vminfo)
        } else {
            None
        }
    }

    /// Concrete kstat name of the struct.
    pub fn name(self) -> &'static str {
        match self {
            StructuredKind::Vminfo => "vminfo",
        }
    }
}

/// Contents of `vminfo_t`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vminfo {
    pub freemem: u64,
    pub swap_resv: u64,
    pub swap_alloc: u64,
    pub swap_avail: u64,
    pub swap_free: u64,
    pub updates: u64,
}

/// A structured kstat read, addressable by counter id.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredStats {
    Vminfo { data: Vminfo, snaptime: i64 },
}

impl StructuredStats {
    /// Returns the field mapped to `id`.
    pub fn get(&self, id: &str) -> Option<u64> {
        match self {
            StructuredStats::Vminfo { data, .. } => match id {
                "freemem" => Some(data.freemem),
                "swap_alloc" => Some(data.swap_alloc),
                "swap_avail" => Some(data.swap_avail),
                "swap_free" => Some(data.swap_free),
                "swap_resv" => Some(data.swap_resv),
                "updates" => Some(data.updates),
                _ => None,
            },
        }
    }

    pub fn snaptime(&self) -> i64 {
        match self {
            StructuredStats::Vminfo { snaptime, .. } => *snaptime,
        }
    }
}

/// Factory for scrape sessions.
pub trait KstatSource: Send + Sync {
    type Session: KstatSession;

    /// Opens a session. The session is closed when dropped.
    fn open(&self) -> Result<Self::Session, SourceError>;
}

/// A live handle on the statistics interface, owned by one scrape.
pub trait KstatSession {
    /// Finds the kstats of `module` at `instance` whose name matches `group`.
    ///
    /// # Returns
    /// Matching entries in chain order, or `SourceError::NotFound` if none
    /// exist. Entries are located only; call [`KstatSession::read`] before
    /// reading their values.
    fn lookup(
        &mut self,
        module: &str,
        instance: u32,
        group: &GroupPattern,
    ) -> Result<Vec<KstatEntry>, SourceError>;

    /// Refreshes one entry's data and snapshot time from the source.
    fn read(&mut self, entry: &mut KstatEntry) -> Result<(), SourceError>;

    /// Reads the named statistic `stat` from a read entry.
    fn named_value(&mut self, entry: &KstatEntry, stat: &str) -> Result<u64, SourceError>;

    /// Reads a fixed-layout kstat.
    fn structured(&mut self, kind: StructuredKind) -> Result<StructuredStats, SourceError>;

    /// Returns the refresh time recorded by the last read of the entry.
    fn snapshot_time(&self, entry: &KstatEntry) -> i64 {
        entry.snaptime
    }
}
