//! CPU frequency scaling through sysfs
//!
//! Values under `cpufreq/` are kHz integers followed by a newline; the public
//! surface speaks MHz.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CPU_ROOT: &str = "/sys/devices/system/cpu";

const CPUINFO_MIN: &str = "cpuinfo_min_freq";
const CPUINFO_MAX: &str = "cpuinfo_max_freq";
const SCALING_MIN: &str = "scaling_min_freq";
const SCALING_MAX: &str = "scaling_max_freq";
const SCALING_CUR: &str = "scaling_cur_freq";

#[derive(Debug, thiserror::Error)]
pub enum CpuFreqError {
    #[error("no cpufreq directories found under {0}")]
    NoCpus(PathBuf),

    #[error("invalid cpufreq glob: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("requested minimum frequency {requested} MHz is below hardware minimum {hardware} MHz")]
    BelowMinimum { requested: u64, hardware: u64 },

    #[error("requested maximum frequency {requested} MHz is above hardware maximum {hardware} MHz")]
    AboveMaximum { requested: u64, hardware: u64 },

    #[error("requested minimum frequency {min} MHz is above requested maximum {max} MHz")]
    MinAboveMax { min: u64, max: u64 },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value '{value}' in {path}")]
    Parse { path: PathBuf, value: String },

    #[error("failed to write {file} of {cpu}: {source}")]
    Write {
        cpu: String,
        file: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Closed MHz interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyRange {
    pub min_mhz: u64,
    pub max_mhz: u64,
}

#[derive(Debug, Clone)]
struct Cpu {
    name: String,
    dir: PathBuf,
}

/// Scaling limits of one CPU exactly as read from sysfs
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuLimits {
    pub cpu: String,
    pub min_khz: u64,
    pub max_khz: u64,
}

/// Per-CPU scaling controller
#[derive(Debug, Clone)]
pub struct CpuFreq {
    cpus: Vec<Cpu>,
}

impl CpuFreq {
    pub fn discover() -> Result<Self, CpuFreqError> {
        Self::discover_in(Path::new(DEFAULT_CPU_ROOT))
    }

    /// Enumerate `cpu[0-9]*/cpufreq` under `root`, sorted by CPU number
    pub fn discover_in(root: &Path) -> Result<Self, CpuFreqError> {
        let pattern = root.join("cpu[0-9]*").join("cpufreq");
        let mut cpus: Vec<Cpu> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(Result::ok)
            .filter(|dir| dir.is_dir())
            .filter_map(|dir| {
                let name = dir.parent()?.file_name()?.to_string_lossy().into_owned();
                Some(Cpu { name, dir })
            })
            .collect();

        if cpus.is_empty() {
            return Err(CpuFreqError::NoCpus(root.to_path_buf()));
        }
        cpus.sort_by_key(|cpu| cpu_number(&cpu.name));
        Ok(Self { cpus })
    }

    pub fn cpu_names(&self) -> Vec<String> {
        self.cpus.iter().map(|c| c.name.clone()).collect()
    }

    /// Range every CPU supports
    pub fn hardware_range(&self) -> Result<FrequencyRange, CpuFreqError> {
        let mut range = FrequencyRange {
            min_mhz: 0,
            max_mhz: u64::MAX,
        };
        for cpu in &self.cpus {
            range.min_mhz = range.min_mhz.max(read_mhz(&cpu.dir.join(CPUINFO_MIN))?);
            range.max_mhz = range.max_mhz.min(read_mhz(&cpu.dir.join(CPUINFO_MAX))?);
        }
        Ok(range)
    }

    /// Raw kHz scaling limits of every CPU, the revert target of [`Self::restore`]
    pub fn snapshot(&self) -> Result<Vec<CpuLimits>, CpuFreqError> {
        self.cpus
            .iter()
            .map(|cpu| {
                Ok(CpuLimits {
                    cpu: cpu.name.clone(),
                    min_khz: read_khz(&cpu.dir.join(SCALING_MIN))?,
                    max_khz: read_khz(&cpu.dir.join(SCALING_MAX))?,
                })
            })
            .collect()
    }

    /// `scaling_cur_freq` of the first CPU
    pub fn current_frequency_mhz(&self) -> Result<u64, CpuFreqError> {
        read_mhz(&self.first().dir.join(SCALING_CUR))
    }

    /// Check `hw_min <= min <= max <= hw_max`
    pub fn validate(&self, min_mhz: u64, max_mhz: u64) -> Result<FrequencyRange, CpuFreqError> {
        let hardware = self.hardware_range()?;
        if min_mhz < hardware.min_mhz {
            return Err(CpuFreqError::BelowMinimum {
                requested: min_mhz,
                hardware: hardware.min_mhz,
            });
        }
        if max_mhz > hardware.max_mhz {
            return Err(CpuFreqError::AboveMaximum {
                requested: max_mhz,
                hardware: hardware.max_mhz,
            });
        }
        if min_mhz > max_mhz {
            return Err(CpuFreqError::MinAboveMax {
                min: min_mhz,
                max: max_mhz,
            });
        }
        Ok(FrequencyRange { min_mhz, max_mhz })
    }

    /// Validate and apply new scaling limits to every CPU
    pub fn set_limits(&self, min_mhz: u64, max_mhz: u64) -> Result<(), CpuFreqError> {
        let range = self.validate(min_mhz, max_mhz)?;
        for cpu in &self.cpus {
            write_limits(cpu, range.min_mhz * 1000, range.max_mhz * 1000)?;
        }
        Ok(())
    }

    /// Write each CPU's captured limits back without hardware validation
    ///
    /// Every CPU is attempted; the first failure is returned.
    pub fn restore(&self, snapshot: &[CpuLimits]) -> Result<(), CpuFreqError> {
        let mut first_error = None;
        for limits in snapshot {
            let Some(cpu) = self.cpus.iter().find(|cpu| cpu.name == limits.cpu) else {
                warn!(cpu = %limits.cpu, "CPU vanished, scaling limits not restored");
                continue;
            };
            if let Err(e) = write_limits(cpu, limits.min_khz, limits.max_khz) {
                warn!(cpu = %limits.cpu, "Restoring scaling limits failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn first(&self) -> &Cpu {
        // discover_in guarantees at least one entry
        &self.cpus[0]
    }
}

fn cpu_number(name: &str) -> u32 {
    name.trim_start_matches("cpu").parse().unwrap_or(u32::MAX)
}

/// Order of the two limit writes so the kernel never sees min > max
///
/// Max goes first when it is being lowered, min first otherwise.
fn write_order(current_max_khz: u64, min_khz: u64, max_khz: u64) -> [(&'static str, u64); 2] {
    if max_khz < current_max_khz {
        [(SCALING_MAX, max_khz), (SCALING_MIN, min_khz)]
    } else {
        [(SCALING_MIN, min_khz), (SCALING_MAX, max_khz)]
    }
}

fn write_limits(cpu: &Cpu, min_khz: u64, max_khz: u64) -> Result<(), CpuFreqError> {
    let current_max = read_khz(&cpu.dir.join(SCALING_MAX))?;
    for (file, khz) in write_order(current_max, min_khz, max_khz) {
        write_khz(&cpu.dir.join(file), khz).map_err(|source| CpuFreqError::Write {
            cpu: cpu.name.clone(),
            file,
            source,
        })?;
    }
    debug!(cpu = %cpu.name, min_khz, max_khz, "Scaling limits written");
    Ok(())
}

fn read_mhz(path: &Path) -> Result<u64, CpuFreqError> {
    read_khz(path).map(|khz| khz / 1000)
}

fn read_khz(path: &Path) -> Result<u64, CpuFreqError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CpuFreqError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let khz: u64 = raw.trim().parse().map_err(|_| CpuFreqError::Parse {
        path: path.to_path_buf(),
        value: raw.trim().to_string(),
    })?;
    Ok(khz)
}

fn write_khz(path: &Path, khz: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(khz.to_string().as_bytes())
}

/// Fake `cpu[N]/cpufreq` trees for tests
#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    pub fn write_cpu(root: &Path, cpu: usize, files: &[(&str, u64)]) {
        let dir = root.join(format!("cpu{}", cpu)).join("cpufreq");
        std::fs::create_dir_all(&dir).unwrap();
        for (file, khz) in files {
            std::fs::write(dir.join(file), format!("{}\n", khz)).unwrap();
        }
    }

    pub fn standard_cpu(root: &Path, cpu: usize) {
        write_cpu(
            root,
            cpu,
            &[
                ("cpuinfo_min_freq", 2_800_000),
                ("cpuinfo_max_freq", 3_600_000),
                ("scaling_min_freq", 2_800_000),
                ("scaling_max_freq", 3_600_000),
                ("scaling_cur_freq", 3_100_000),
            ],
        );
    }

    pub fn read(root: &Path, cpu: usize, file: &str) -> String {
        std::fs::read_to_string(root.join(format!("cpu{}/cpufreq/{}", cpu, file)))
            .unwrap()
            .trim()
            .to_string()
    }
}
