//! Disk and memory fill
//!
//! - `disk.rs`: the fill-disk action (`fallocate` or `dd`)
//! - `memory.rs`: the fill-mem action supervising the allocator child
//! - `allocator.rs`: the allocator itself, run as `host-fault-agent memfill`

pub mod allocator;
pub mod disk;
pub mod memory;

pub use allocator::{MemFillMode, MemFillPlan, MemUnit};
pub use disk::{DiskFillAction, FillMethod, FillMode, VolumeUsage};
pub use memory::MemFillAction;
