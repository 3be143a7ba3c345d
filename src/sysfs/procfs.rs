//! procfs access: sysrq, OOM score and memory accounting

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// OOM score written for the agent at boot
pub const AGENT_OOM_SCORE_ADJ: i32 = -997;

/// Magic sysrq keys the shutdown strategy uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysRqKey {
    Sync,
    Reboot,
    PowerOff,
}

impl SysRqKey {
    fn as_byte(self) -> &'static [u8] {
        match self {
            SysRqKey::Sync => b"s",
            SysRqKey::Reboot => b"b",
            SysRqKey::PowerOff => b"o",
        }
    }
}

/// `/proc/sys/kernel/sysrq` and `/proc/sysrq-trigger`
#[derive(Debug, Clone)]
pub struct SysRq {
    proc_root: PathBuf,
}

impl Default for SysRq {
    fn default() -> Self {
        Self::new(Path::new(DEFAULT_PROC_ROOT))
    }
}

impl SysRq {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
        }
    }

    fn enable_path(&self) -> PathBuf {
        self.proc_root.join("sys/kernel/sysrq")
    }

    fn trigger_path(&self) -> PathBuf {
        self.proc_root.join("sysrq-trigger")
    }

    /// Both control files exist
    pub fn available(&self) -> bool {
        self.enable_path().exists() && self.trigger_path().exists()
    }

    /// Allow all sysrq functions
    pub fn enable(&self) -> Result<()> {
        std::fs::write(self.enable_path(), b"1")
            .with_context(|| format!("Failed to enable sysrq via {:?}", self.enable_path()))
    }

    pub fn trigger(&self, key: SysRqKey) -> Result<()> {
        std::fs::write(self.trigger_path(), key.as_byte())
            .with_context(|| format!("Failed to write sysrq key {:?}", key))
    }
}

/// Lower the OOM score of this process so the kernel picks attack children first
pub fn protect_from_oom_killer(proc_root: &Path) {
    let path = proc_root.join("self/oom_score_adj");
    match std::fs::write(&path, AGENT_OOM_SCORE_ADJ.to_string()) {
        Ok(()) => info!("Set oom_score_adj to {}", AGENT_OOM_SCORE_ADJ),
        Err(e) => warn!("Failed to set oom_score_adj via {:?}: {}", path, e),
    }
}

/// Subset of `/proc/meminfo`, in kB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemInfo {
    pub fn read(proc_root: &Path) -> Result<Self> {
        let path = proc_root.join("meminfo");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut info = MemInfo::default();
        let mut seen = (false, false);
        for line in raw.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let value: u64 = match value.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            match key {
                "MemTotal:" => {
                    info.total_kb = value;
                    seen.0 = true;
                }
                "MemAvailable:" => {
                    info.available_kb = value;
                    seen.1 = true;
                }
                _ => {}
            }
        }
        if !(seen.0 && seen.1) {
            anyhow::bail!("meminfo lacks MemTotal or MemAvailable");
        }
        Ok(info)
    }

    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MEMINFO: &str = "MemTotal:       16318480 kB\n\
                           MemFree:         1200000 kB\n\
                           MemAvailable:    8159240 kB\n\
                           Buffers:          200000 kB\n";

    #[test]
    fn test_meminfo_parse() {
        let info = MemInfo::parse(MEMINFO).unwrap();
        assert_eq!(info.total_kb, 16_318_480);
        assert_eq!(info.available_kb, 8_159_240);
        assert_eq!(info.used_kb(), 8_159_240);
    }

    #[test]
    fn test_meminfo_missing_fields() {
        assert!(MemInfo::parse("MemTotal: 100 kB\n").is_err());
    }

    #[test]
    fn test_sysrq_writes_keys() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sys/kernel")).unwrap();
        std::fs::write(dir.path().join("sys/kernel/sysrq"), "0").unwrap();
        std::fs::write(dir.path().join("sysrq-trigger"), "").unwrap();

        let sysrq = SysRq::new(dir.path());
        assert!(sysrq.available());
        sysrq.enable().unwrap();
        sysrq.trigger(SysRqKey::Reboot).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("sys/kernel/sysrq")).unwrap(),
            "1"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sysrq-trigger")).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_oom_score_written() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("self")).unwrap();
        protect_from_oom_killer(dir.path());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("self/oom_score_adj")).unwrap(),
            "-997"
        );
    }
}
