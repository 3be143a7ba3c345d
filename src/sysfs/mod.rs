//! sysfs and procfs access
//!
//! - `cpufreq.rs`: per-CPU scaling limits under `/sys/devices/system/cpu`
//! - `procfs.rs`: sysrq, `oom_score_adj` and `/proc/meminfo`
//!
//! Roots are parameters so tests run against temporary trees.

pub mod cpufreq;
pub mod procfs;

pub use cpufreq::{CpuFreq, CpuFreqError, CpuLimits, FrequencyRange, DEFAULT_CPU_ROOT};
pub use procfs::{protect_from_oom_killer, MemInfo, SysRq, SysRqKey, DEFAULT_PROC_ROOT};
