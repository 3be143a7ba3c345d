//! Host-level attacks
//!
//! - `cpu_frequency.rs`: scaling limits via cpufreq sysfs
//! - `timetravel.rs`: realtime clock offset with optional NTP block
//! - `stop_process.rs`: periodic SIGTERM/SIGKILL of matching processes
//! - `shutdown.rs`: reboot or power off

pub mod cpu_frequency;
pub mod shutdown;
pub mod stop_process;
pub mod timetravel;

pub use cpu_frequency::{CpuFrequencyAction, CPU_FREQUENCY_METRIC};
pub use shutdown::{ShutdownAction, ShutdownStrategy};
pub use stop_process::{ProcessFilter, StopProcessAction};
pub use timetravel::{HostClock, SystemClock, TimeTravelAction};
