//! Memory allocator child
//!
//! Runs as `host-fault-agent memfill`. In `usage` mode the footprint is
//! recomputed every second so the host's total usage stays at the target; in
//! `absolute` mode it is allocated once and held. Every page is written so
//! the memory is resident rather than merely reserved.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::sysfs::MemInfo;

const PAGE: usize = 4096;
const CHUNK_KB: u64 = 16 * 1024;
const ADJUST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MemFillMode {
    #[serde(alias = "Usage")]
    Usage,
    #[serde(alias = "Absolute")]
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MemUnit {
    #[serde(alias = "Megabyte")]
    Megabyte,
    #[serde(alias = "Percent")]
    Percent,
}

impl MemFillMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MemFillMode::Usage => "usage",
            MemFillMode::Absolute => "absolute",
        }
    }
}

impl MemUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            MemUnit::Megabyte => "megabyte",
            MemUnit::Percent => "percent",
        }
    }

    /// `size` in kB against the host's total memory
    pub fn to_kb(self, size: u64, total_kb: u64) -> u64 {
        match self {
            MemUnit::Megabyte => size.saturating_mul(1024),
            MemUnit::Percent => total_kb.saturating_mul(size.min(100)) / 100,
        }
    }
}

/// What the allocator should hold right now, in kB
///
/// `own_kb` is the allocator's current footprint, which is part of the
/// host's used memory and must not be counted twice.
pub fn desired_footprint_kb(
    mode: MemFillMode,
    unit: MemUnit,
    size: u64,
    meminfo: MemInfo,
    own_kb: u64,
) -> u64 {
    let target = unit.to_kb(size, meminfo.total_kb);
    match mode {
        MemFillMode::Absolute => target,
        MemFillMode::Usage => {
            let others = meminfo.used_kb().saturating_sub(own_kb);
            target.saturating_sub(others)
        }
    }
}

/// Resident memory held in chunks of at most 16 MB
#[derive(Debug, Default)]
pub struct Ballast {
    chunks: Vec<Vec<u8>>,
    held_kb: u64,
}

impl Ballast {
    pub fn footprint_kb(&self) -> u64 {
        self.held_kb
    }

    /// Grow or shrink to exactly `kb`
    pub fn resize_to(&mut self, kb: u64) {
        while self.held_kb < kb {
            let chunk_kb = (kb - self.held_kb).min(CHUNK_KB);
            let size = (chunk_kb * 1024) as usize;
            let mut chunk = vec![0u8; size];
            for offset in (0..size).step_by(PAGE) {
                chunk[offset] = 1;
            }
            self.chunks.push(chunk);
            self.held_kb += chunk_kb;
        }
        while self.held_kb > kb {
            let Some(mut last) = self.chunks.pop() else {
                self.held_kb = 0;
                break;
            };
            self.held_kb -= last.len() as u64 / 1024;
            if self.held_kb < kb {
                let keep_kb = kb - self.held_kb;
                last.truncate((keep_kb * 1024) as usize);
                last.shrink_to_fit();
                self.chunks.push(last);
                self.held_kb += keep_kb;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemFillPlan {
    pub mode: MemFillMode,
    pub unit: MemUnit,
    pub size: u64,
    pub duration: Duration,
    pub proc_root: PathBuf,
}

/// Hold memory according to the plan until the duration elapses
pub async fn run(plan: MemFillPlan) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + plan.duration;
    let mut ballast = Ballast::default();
    let mut interval = tokio::time::interval(ADJUST_INTERVAL);
    info!(
        mode = plan.mode.as_str(),
        unit = plan.unit.as_str(),
        size = plan.size,
        "Memory fill started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = interval.tick() => {
                adjust(&plan, &mut ballast, &plan.proc_root)?;
                if plan.mode == MemFillMode::Absolute {
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
            }
        }
    }

    info!(held_kb = ballast.footprint_kb(), "Memory fill finished");
    Ok(())
}

fn adjust(plan: &MemFillPlan, ballast: &mut Ballast, proc_root: &Path) -> anyhow::Result<()> {
    let meminfo = MemInfo::read(proc_root)?;
    let desired = desired_footprint_kb(
        plan.mode,
        plan.unit,
        plan.size,
        meminfo,
        ballast.footprint_kb(),
    );
    if desired != ballast.footprint_kb() {
        debug!(from_kb = ballast.footprint_kb(), to_kb = desired, "Adjusting memory footprint");
        ballast.resize_to(desired);
    }
    Ok(())
}
