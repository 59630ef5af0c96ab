//! The OS memory probe used to size the browser-job worker pool.
//!
//! Kept behind a trait so tests can stub it and so probe failure stays a
//! distinct error path affecting only the phase that depends on it.
use thiserror::Error;

pub trait MemoryProbe: Send + Sync {
    /// Memory that can be handed to processes right now without swapping,
    /// in bytes.
    fn available_memory_bytes(&self) -> Result<u64, ProbeError>;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("memory probe unavailable: {0}")]
    Unavailable(String),
}

/// Probes `/proc/meminfo` on Linux; unavailable elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn available_memory_bytes(&self) -> Result<u64, ProbeError> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .map_err(|err| ProbeError::Unavailable(format!("cannot read /proc/meminfo: {err}")))?;
        let available = parse_meminfo_available(&meminfo).ok_or_else(|| {
            ProbeError::Unavailable("no MemAvailable field in /proc/meminfo".to_owned())
        })?;
        tracing::debug!(
            available_mb = available / 1_000_000,
            "probed available physical memory"
        );
        Ok(available)
    }

    #[cfg(not(target_os = "linux"))]
    fn available_memory_bytes(&self) -> Result<u64, ProbeError> {
        Err(ProbeError::Unavailable(
            "no memory probe for this platform; set an explicit worker count".to_owned(),
        ))
    }
}

/// Extracts `MemAvailable` (reported in kB) as bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.trim().split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_mem_available_line() {
        let meminfo = "MemTotal:       16315400 kB\nMemFree:          734816 kB\nMemAvailable:    8231920 kB\n";
        assert_eq!(parse_meminfo_available(meminfo), Some(8_231_920 * 1024));
    }

    #[test]
    fn missing_field_is_none() {
        assert_eq!(parse_meminfo_available("MemTotal: 1 kB\n"), None);
    }
}
