//! `libkstat` bindings for illumos and Solaris.
//!
//! Each session owns one `kstat_ctl_t` from `kstat_open(3KSTAT)` and closes it
//! on drop. Kstat pointers handed out through `KstatEntry::slot` index into the
//! session's handle table and stay valid until the session is closed.

use std::ffi::{CString, c_char, c_int, c_uint, c_void};
use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use crate::collector::traits::{
    KstatEntry, KstatSession, KstatSource, SourceError, StructuredKind, StructuredStats, Vminfo,
};
use crate::schema::GroupPattern;

const KSTAT_STRLEN: usize = 31;

const KSTAT_TYPE_NAMED: u8 = 1;

const KSTAT_DATA_INT32: u8 = 1;
const KSTAT_DATA_UINT32: u8 = 2;
const KSTAT_DATA_INT64: u8 = 3;
const KSTAT_DATA_UINT64: u8 = 4;

/// `kstat_t` from `<sys/kstat.h>`.
#[allow(dead_code)]
#[repr(C)]
struct RawKstat {
    ks_crtime: i64,
    ks_next: *mut RawKstat,
    ks_kid: c_int,
    ks_module: [c_char; KSTAT_STRLEN],
    ks_resv: u8,
    ks_instance: c_int,
    ks_name: [c_char; KSTAT_STRLEN],
    ks_type: u8,
    ks_class: [c_char; KSTAT_STRLEN],
    ks_flags: u8,
    ks_data: *mut c_void,
    ks_ndata: c_uint,
    ks_data_size: usize,
    ks_snaptime: i64,
    ks_update: *mut c_void,
    ks_private: *mut c_void,
    ks_snapshot: *mut c_void,
    ks_lock: *mut c_void,
}

/// `kstat_ctl_t` from `<kstat.h>`.
#[allow(dead_code)]
#[repr(C)]
struct RawKstatCtl {
    kc_chain_id: c_int,
    kc_chain: *mut RawKstat,
    kc_kd: c_int,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
union RawNamedValue {
    c: [c_char; 16],
    i32: i32,
    ui32: u32,
    i64: i64,
    ui64: u64,
}

/// `kstat_named_t` from `<sys/kstat.h>`.
#[allow(dead_code)]
#[repr(C)]
struct RawNamed {
    name: [c_char; KSTAT_STRLEN],
    data_type: u8,
    value: RawNamedValue,
}

/// `vminfo_t` from `<sys/sysinfo.h>`.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawVminfo {
    freemem: u64,
    swap_resv: u64,
    swap_alloc: u64,
    swap_avail: u64,
    swap_free: u64,
    updates: u64,
}

#[link(name = "kstat")]
unsafe extern "C" {
    fn kstat_open() -> *mut RawKstatCtl;
    fn kstat_close(kc: *mut RawKstatCtl) -> c_int;
    fn kstat_read(kc: *mut RawKstatCtl, ksp: *mut RawKstat, buf: *mut c_void) -> c_int;
    fn kstat_lookup(
        kc: *mut RawKstatCtl,
        module: *const c_char,
        instance: c_int,
        name: *const c_char,
    ) -> *mut RawKstat;
    fn kstat_data_lookup(ksp: *mut RawKstat, name: *const c_char) -> *mut c_void;
}

/// The kernel's kstat interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealKstat;

impl RealKstat {
    pub fn new() -> Self {
        Self
    }
}

impl KstatSource for RealKstat {
    type Session = RealSession;

    fn open(&self) -> Result<RealSession, SourceError> {
        // SAFETY: kstat_open has no preconditions; a null result is handled.
        let kc = unsafe { kstat_open() };
        let kc = NonNull::new(kc).ok_or_else(|| SourceError::Unavailable(io::Error::last_os_error()))?;
        Ok(RealSession {
            kc,
            handles: Vec::new(),
        })
    }
}

/// An open `kstat_ctl_t`.
pub struct RealSession {
    kc: NonNull<RawKstatCtl>,
    handles: Vec<NonNull<RawKstat>>,
}

impl RealSession {
    /// Refreshes the kstat's data from the kernel.
    fn refresh(&mut self, ksp: NonNull<RawKstat>) -> Result<(), SourceError> {
        // SAFETY: ksp belongs to this session's chain, which lives until kstat_close.
        let kid = unsafe { kstat_read(self.kc.as_ptr(), ksp.as_ptr(), ptr::null_mut()) };
        if kid == -1 {
            return Err(SourceError::Read(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Exact lookup through `kstat_lookup(3KSTAT)`.
    fn find_exact(&self, module: &str, instance: c_int, name: &str) -> Option<NonNull<RawKstat>> {
        let module = CString::new(module).ok()?;
        let name = CString::new(name).ok()?;
        // SAFETY: both strings are NUL-terminated and outlive the call.
        let ksp = unsafe { kstat_lookup(self.kc.as_ptr(), module.as_ptr(), instance, name.as_ptr()) };
        NonNull::new(ksp)
    }

    fn find(&self, module: &str, instance: c_int, group: &GroupPattern) -> Vec<NonNull<RawKstat>> {
        if let Some(name) = group.literal() {
            return self.find_exact(module, instance, name).into_iter().collect();
        }

        let mut found = Vec::new();
        // SAFETY: the chain is a NULL-terminated list owned by kc and is not
        // modified while the session is open.
        unsafe {
            let mut ksp = self.kc.as_ref().kc_chain;
            while let Some(ks) = NonNull::new(ksp) {
                let raw = ks.as_ref();
                if raw.ks_instance == instance
                    && c_name(&raw.ks_module) == module
                    && group.is_match(&c_name(&raw.ks_name))
                {
                    found.push(ks);
                }
                ksp = raw.ks_next;
            }
        }
        found
    }
}

impl KstatSession for RealSession {
    fn lookup(
        &mut self,
        module: &str,
        instance: u32,
        group: &GroupPattern,
    ) -> Result<Vec<KstatEntry>, SourceError> {
        let not_found = || SourceError::NotFound {
            module: module.to_string(),
            instance,
            group: group.to_string(),
        };

        let raw_instance = c_int::try_from(instance).map_err(|_| not_found())?;
        let found = self.find(module, raw_instance, group);
        if found.is_empty() {
            return Err(not_found());
        }

        let mut entries = Vec::with_capacity(found.len());
        for ks in found {
            // SAFETY: ks is a live chain entry; its header is valid without a read.
            let raw = unsafe { ks.as_ref() };
            entries.push(KstatEntry::new(
                module,
                instance,
                c_name(&raw.ks_name),
                raw.ks_snaptime,
                self.handles.len(),
            ));
            self.handles.push(ks);
        }
        Ok(entries)
    }

    fn read(&mut self, entry: &mut KstatEntry) -> Result<(), SourceError> {
        let ks = *self
            .handles
            .get(entry.slot)
            .ok_or_else(|| SourceError::NotFound {
                module: entry.module.clone(),
                instance: entry.instance,
                group: entry.name.clone(),
            })?;
        self.refresh(ks)?;
        // SAFETY: handles only holds live chain entries of this session.
        entry.snaptime = unsafe { ks.as_ref().ks_snaptime };
        Ok(())
    }

    fn named_value(&mut self, entry: &KstatEntry, stat: &str) -> Result<u64, SourceError> {
        let missing = || SourceError::MissingStat(stat.to_string());

        let ks = *self.handles.get(entry.slot).ok_or_else(missing)?;
        // SAFETY: handles only holds live chain entries of this session.
        let (ks_type, ks_data) = unsafe { (ks.as_ref().ks_type, ks.as_ref().ks_data) };
        if ks_data.is_null() {
            return Err(SourceError::Read(io::Error::other(format!(
                "{}:{}:{} has not been read",
                entry.module, entry.instance, entry.name
            ))));
        }
        if ks_type != KSTAT_TYPE_NAMED {
            return Err(SourceError::UnsupportedType {
                stat: stat.to_string(),
                data_type: ks_type,
            });
        }

        let name = CString::new(stat).map_err(|_| missing())?;
        // SAFETY: ks_data is non-null, so ks was read and holds its named array.
        let named = unsafe { kstat_data_lookup(ks.as_ptr(), name.as_ptr()) } as *const RawNamed;
        if named.is_null() {
            return Err(missing());
        }

        // SAFETY: kstat_data_lookup returned a pointer into ks_data.
        let named = unsafe { &*named };
        // SAFETY: the active union field is selected by data_type.
        unsafe {
            match named.data_type {
                KSTAT_DATA_UINT32 => Ok(u64::from(named.value.ui32)),
                KSTAT_DATA_UINT64 => Ok(named.value.ui64),
                KSTAT_DATA_INT32 => signed(stat, i64::from(named.value.i32)),
                KSTAT_DATA_INT64 => signed(stat, named.value.i64),
                data_type => Err(SourceError::UnsupportedType {
                    stat: stat.to_string(),
                    data_type,
                }),
            }
        }
    }

    fn structured(&mut self, kind: StructuredKind) -> Result<StructuredStats, SourceError> {
        match kind {
            StructuredKind::Vminfo => {
                let ks = self
                    .find_exact("unix", 0, kind.name())
                    .ok_or_else(|| SourceError::NotFound {
                        module: "unix".to_string(),
                        instance: 0,
                        group: kind.name().to_string(),
                    })?;
                self.refresh(ks)?;

                // SAFETY: ks was just read; ks_data holds ks_data_size bytes.
                let (data, size, snaptime) = unsafe {
                    let raw = ks.as_ref();
                    (raw.ks_data, raw.ks_data_size, raw.ks_snaptime)
                };
                if data.is_null() || size < size_of::<RawVminfo>() {
                    return Err(SourceError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("vminfo is {} bytes", size),
                    )));
                }

                // SAFETY: size checked above; the buffer may be unaligned.
                let raw = unsafe { ptr::read_unaligned(data as *const RawVminfo) };
                Ok(StructuredStats::Vminfo {
                    data: Vminfo {
                        freemem: raw.freemem,
                        swap_resv: raw.swap_resv,
                        swap_alloc: raw.swap_alloc,
                        swap_avail: raw.swap_avail,
                        swap_free: raw.swap_free,
                        updates: raw.updates,
                    },
                    snaptime,
                })
            }
        }
    }
}

impl Drop for RealSession {
    fn drop(&mut self) {
        // SAFETY: kc came from kstat_open and is closed exactly once.
        unsafe {
            kstat_close(self.kc.as_ptr());
        }
    }
}

fn signed(stat: &str, value: i64) -> Result<u64, SourceError> {
    u64::try_from(value).map_err(|_| SourceError::OutOfRange {
        stat: stat.to_string(),
        value,
    })
}

/// Converts a fixed-size, NUL-padded kstat name.
fn c_name(buf: &[c_char; KSTAT_STRLEN]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_misc_is_readable() {
        let mut session = RealKstat::new().open().unwrap();
        let group = GroupPattern::new("system_misc").unwrap();

        let mut entries = session.lookup("unix", 0, &group).unwrap();
        assert_eq!(entries[0].name, "system_misc");
        session.read(&mut entries[0]).unwrap();
        assert!(session.snapshot_time(&entries[0]) > 0);
        assert!(session.named_value(&entries[0], "ncpus").unwrap() > 0);
        assert!(session.lookup("unix", 1, &group).unwrap_err().is_not_found());
    }

    #[test]
    fn test_vminfo_is_readable() {
        let mut session = RealKstat::new().open().unwrap();
        let stats = session.structured(StructuredKind::Vminfo).unwrap();
        assert!(stats.get("updates").is_some());
    }

    #[test]
    fn test_c_name_stops_at_nul() {
        let mut buf = [0 as c_char; KSTAT_STRLEN];
        for (dst, src) in buf.iter_mut().zip(b"sys") {
            *dst = *src as c_char;
        }
        assert_eq!(c_name(&buf), "sys");
    }
}
