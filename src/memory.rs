//! Memory budgeting for tile processing.
//!
//! Provides:
//! - Byte suffix parsing (e.g., "4G", "512M", "auto")
//! - Platform-specific memory detection
//! - The per-worker tile memory precondition
//!
//! The check is a precondition, not a runtime limiter: before any tile is
//! dispatched, the largest padded tile's working set is compared against
//! the per-worker budget, and a run that would not fit fails up front
//! instead of dying mid-phase on an allocation.

use crate::error::{Result, VoxtileError};
use crate::tiling::TileGrid;

/// Parse a byte size string with optional suffix.
///
/// Supports:
/// - Integer values: "1024" -> 1024 bytes
/// - Decimal values with suffix: "1.5G" -> 1.5 * 1024^3 bytes
/// - Suffixes (case-insensitive): B, K, KB, M, MB, G, GB, T, TB
/// - "auto" returns None (signals auto-detection)
pub fn parse_byte_suffix(s: &str) -> Result<Option<usize>> {
    let s = s.trim();

    if s.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }

    let numeric_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    if numeric_end == 0 {
        return Err(VoxtileError::config(format!(
            "invalid byte size: '{}' (no numeric value)",
            s
        )));
    }

    let numeric_part = &s[..numeric_end];
    let suffix_part = s[numeric_end..].trim();

    let value: f64 = numeric_part
        .parse()
        .map_err(|_| VoxtileError::config(format!("invalid numeric value: '{}'", numeric_part)))?;

    let multiplier: u64 = match suffix_part.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(VoxtileError::config(format!(
                "unknown byte suffix: '{}' (use B, K, M, G, or T)",
                suffix_part
            )))
        }
    };

    let result = value * multiplier as f64;
    if !result.is_finite() || result < 0.0 || result > usize::MAX as f64 {
        return Err(VoxtileError::config(format!(
            "byte size overflow: '{}' exceeds maximum representable value",
            s
        )));
    }
    Ok(Some(result.round() as usize))
}

/// Source of available memory information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    /// cgroups v2 memory.max
    CgroupsV2,
    /// /proc/meminfo MemAvailable
    ProcMeminfo,
    /// Fallback default (8GB)
    Fallback,
}

/// Result of available memory detection.
#[derive(Debug, Clone)]
pub struct AvailableMemory {
    pub bytes: usize,
    pub source: MemorySource,
}

/// Default fallback memory (8GB).
pub const FALLBACK_MEMORY_BYTES: usize = 8 * 1024 * 1024 * 1024;

/// Detect available system memory.
///
/// On Linux, tries the cgroups v2 memory.max limit, then /proc/meminfo
/// MemAvailable. Falls back to 8GB if detection fails.
pub fn detect_available_memory() -> AvailableMemory {
    #[cfg(target_os = "linux")]
    {
        if let Some(bytes) = read_cgroups_v2_limit() {
            return AvailableMemory {
                bytes,
                source: MemorySource::CgroupsV2,
            };
        }
        if let Some(bytes) = read_proc_meminfo_available() {
            return AvailableMemory {
                bytes,
                source: MemorySource::ProcMeminfo,
            };
        }
    }

    AvailableMemory {
        bytes: FALLBACK_MEMORY_BYTES,
        source: MemorySource::Fallback,
    }
}

#[cfg(target_os = "linux")]
fn read_cgroups_v2_limit() -> Option<usize> {
    // v2 format in /proc/self/cgroup: "0::<path>"
    let cgroup_content = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    let mut cgroup_path = None;

    for line in cgroup_content.lines() {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() == 3 && parts[0] == "0" && parts[1].is_empty() {
            let path = parts[2];
            if !path.is_empty() && path != "/" {
                cgroup_path = Some(path.to_string());
            }
            break;
        }
    }

    let path = cgroup_path?;
    let memory_max_path = format!("/sys/fs/cgroup{}/memory.max", path);
    let content = std::fs::read_to_string(&memory_max_path).ok()?;
    let trimmed = content.trim();

    // "max" means no limit
    if trimmed == "max" {
        return None;
    }

    trimmed.parse().ok()
}

#[cfg(target_os = "linux")]
fn read_proc_meminfo_available() -> Option<usize> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;

    for line in content.lines() {
        if line.starts_with("MemAvailable:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                let kb: usize = parts[1].parse().ok()?;
                return Some(kb * 1024);
            }
        }
    }

    None
}

/// Resolve the per-worker budget: an explicit budget is used as given,
/// "auto" (None) splits detected memory evenly across workers.
pub fn resolve_worker_budget(explicit: Option<usize>, workers: usize) -> usize {
    match explicit {
        Some(bytes) => bytes,
        None => {
            let detected = detect_available_memory();
            let per_worker = detected.bytes / workers.max(1);
            log::info!(
                "auto memory budget: {} detected ({:?}), {} per worker",
                format_bytes(detected.bytes),
                detected.source,
                format_bytes(per_worker)
            );
            per_worker
        }
    }
}

/// Working-set estimate for classifying one padded tile, in bytes.
///
/// Dominated by f32 buffers: the intensity tile (1 plane), per-class
/// probability maps (`num_classes` planes), and one plane of slack for the
/// mask and staging copies. Sized on the largest padded tile of the grid
/// so the check holds for every tile.
pub fn tile_memory_requirement(grid: &TileGrid, num_classes: usize) -> Result<usize> {
    grid.max_padded_voxels()
        .checked_mul(num_classes + 2)
        .and_then(|v| v.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| VoxtileError::config("tile memory requirement overflows"))
}

/// The precondition itself: fail before dispatch if the largest tile's
/// working set exceeds the per-worker budget.
pub fn check_budget(grid: &TileGrid, num_classes: usize, budget: usize) -> Result<()> {
    let required = tile_memory_requirement(grid, num_classes)?;
    if required > budget {
        return Err(VoxtileError::MemoryBudget { required, budget });
    }
    log::debug!(
        "memory precondition ok: {} required, {} budgeted per worker",
        format_bytes(required),
        format_bytes(budget)
    );
    Ok(())
}

/// Format bytes as human-readable string.
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;
    const TB: usize = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
