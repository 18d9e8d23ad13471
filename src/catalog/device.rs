//! Device capability detection for model availability.

use tracing::{debug, warn};

/// Memory assumed when detection fails.
pub const FALLBACK_MEMORY_GB: f64 = 4.0;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Capabilities of the device that will host the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceProfile {
    /// Total physical memory in gigabytes.
    pub memory_gb: f64,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            memory_gb: FALLBACK_MEMORY_GB,
        }
    }
}

impl DeviceProfile {
    /// Profile with a fixed memory size (config override, tests).
    pub fn with_memory_gb(memory_gb: f64) -> Self {
        Self { memory_gb }
    }

    /// Detect total physical memory of the current device.
    pub fn detect() -> Self {
        match detect_memory_bytes() {
            Some(bytes) => {
                let memory_gb = bytes as f64 / BYTES_PER_GB;
                debug!(memory_gb, "detected device memory");
                Self { memory_gb }
            }
            None => {
                warn!(
                    fallback_gb = FALLBACK_MEMORY_GB,
                    "could not detect device memory, using fallback"
                );
                Self::default()
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn detect_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&meminfo)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn detect_memory_bytes() -> Option<u64> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
fn detect_memory_bytes() -> Option<u64> {
    None
}

/// Parse the `MemTotal:` line of `/proc/meminfo` (reported in kB).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
