//! Pre-built mock kstat scenarios for testing.
//!
//! These scenarios provide realistic kstat chains for testing various system
//! conditions.

use super::source::MockKstat;
use crate::collector::traits::Vminfo;

impl MockKstat {
    /// Creates `n` CPUs exposing `cpu:<i>:sys` with a `syscall` counter.
    ///
    /// CPU `i` reports `syscall = 100 * (i + 1)` and `snaptime = 1000 + i`.
    pub fn with_cpus(n: u32) -> Self {
        let mut ks = Self::new();
        for cpu in 0..n {
            ks.add_kstat(
                "cpu",
                cpu,
                "sys",
                1000 + i64::from(cpu),
                &[("syscall", 100 * (u64::from(cpu) + 1))],
            );
        }
        ks
    }

    /// Creates a typical four-CPU system with ZFS.
    ///
    /// Includes `cpu:*:sys`, `cpu:*:vm`, `unix:0:system_misc`,
    /// `unix:0:vminfo`, `zfs:0:arcstats` and two per-zone `zone_misc` kstats
    /// that match the groups in `config/kstat.yml`.
    pub fn typical_system() -> Self {
        let mut ks = Self::new();
        let snaptime = 1_234_567_890_123;

        for cpu in 0..4u64 {
            let base = cpu * 1_000;
            ks.add_kstat(
                "cpu",
                cpu as u32,
                "sys",
                snaptime + cpu as i64,
                &[
                    ("cpu_nsec_idle", 8_000_000_000_000 + base),
                    ("cpu_nsec_kernel", 1_500_000_000_000 + base),
                    ("cpu_nsec_user", 2_500_000_000_000 + base),
                    ("cpu_nsec_intr", 40_000_000_000 + base),
                    ("cpu_nsec_dtrace", 0),
                    ("cpu_ticks_idle", 800_000 + base),
                    ("cpu_ticks_kernel", 150_000 + base),
                    ("cpu_ticks_user", 250_000 + base),
                    ("cpu_ticks_wait", 0),
                    ("cpu_load_intr", 3),
                    ("cpumigrate", 5_000 + base),
                    ("iowait", 0),
                    ("nthreads", 2_000 + base),
                    ("syscall", 9_000_000 + base),
                    ("sysexec", 1_200 + base),
                    ("sysfork", 1_300 + base),
                    ("sysread", 3_000_000 + base),
                    ("sysvfork", 40 + base),
                    ("syswrite", 2_000_000 + base),
                ],
            );
            ks.add_kstat(
                "cpu",
                cpu as u32,
                "vm",
                snaptime + cpu as i64,
                &[
                    ("pgin", 10_000 + base),
                    ("pgout", 2_000 + base),
                    ("anonpgin", 100 + base),
                    ("anonfree", 50 + base),
                    ("swapin", 0),
                    ("swapout", 0),
                ],
            );
        }

        ks.add_kstat(
            "unix",
            0,
            "system_misc",
            snaptime,
            &[
                ("ncpus", 4),
                ("nproc", 142),
                ("clk_intr", 123_456_789),
                ("boot_time", 1_700_000_000),
                ("avenrun_1min", 384),
                ("avenrun_5min", 256),
                ("avenrun_15min", 128),
            ],
        );

        ks.set_vminfo(
            Vminfo {
                freemem: 1_000_000_000,
                swap_resv: 2_000_000,
                swap_alloc: 1_500_000,
                swap_avail: 3_000_000,
                swap_free: 3_500_000,
                updates: 1_200,
            },
            snaptime,
        );

        ks.add_kstat(
            "zfs",
            0,
            "arcstats",
            snaptime,
            &[
                ("hits", 5_000_000),
                ("misses", 250_000),
                ("size", 8_589_934_592),
                ("c", 8_589_934_592),
                ("c_max", 16_106_127_360),
                ("c_min", 1_073_741_824),
            ],
        );

        ks.add_kstat(
            "zones",
            0,
            "zone_misc_global",
            snaptime,
            &[("nprocs", 120), ("nsec_user", 9_000_000_000)],
        );
        ks.add_kstat(
            "zones",
            0,
            "zone_misc_web",
            snaptime,
            &[("nprocs", 22), ("nsec_user", 1_000_000_000)],
        );

        ks
    }
}
