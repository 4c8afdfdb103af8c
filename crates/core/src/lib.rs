#![forbid(unsafe_code)]

use serde::Deserialize;
use std::collections::VecDeque;

mod detector;
mod discovery;
mod flow;
mod host;
mod pattern;
mod pool;
mod ports;
mod types;

pub use detector::*;
pub use discovery::*;
pub use flow::*;
pub use host::*;
pub use pattern::*;
pub use pool::*;
pub use ports::*;
pub use types::*;

/// Worker tunables. Unknown keys in the config file are an error.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Identifies the worker in trace output.
    pub instance_id: u32,
    /// Verbose per-packet trace into the in-memory ring.
    pub debug: bool,
    /// 1 reinterprets well-known TLS wrapper ports as their cleartext
    /// services.
    pub detection_level: u8,
    /// Host-monitor mode; gates the DHCP lease side channel.
    pub rna_mode: bool,
    pub host_cache_capacity: usize,
    pub host_cache_shards: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            instance_id: 0,
            debug: false,
            detection_level: 0,
            rna_mode: false,
            host_cache_capacity: 65_536,
            host_cache_shards: 16,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.detection_level > 1 {
            return Err(format!(
                "detection_level must be 0 or 1, got {}",
                self.detection_level
            ));
        }
        if self.host_cache_capacity == 0 {
            return Err("host_cache_capacity must be at least 1".into());
        }
        if self.host_cache_shards == 0 {
            return Err("host_cache_shards must be at least 1".into());
        }
        Ok(())
    }
}

/// Bounded in-memory trace ring. The engine never prints; callers drain
/// this when they want the story of a packet.
#[derive(Debug)]
pub struct TraceLog {
    enabled: bool,
    cap: usize,
    lines: VecDeque<String>,
}

impl TraceLog {
    pub fn new(enabled: bool, cap: usize) -> Self {
        TraceLog {
            enabled,
            cap: cap.max(1),
            lines: VecDeque::new(),
        }
    }

    /// Append a line; the message is only rendered when tracing is on.
    pub fn log(&mut self, line: impl FnOnce() -> String) {
        if !self.enabled {
            return;
        }
        if self.lines.len() >= self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line());
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_unknown_detection_levels() {
        let mut config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        config.detection_level = 1;
        assert!(config.validate().is_ok());
        config.detection_level = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn trace_ring_is_bounded_and_gated() {
        let mut trace = TraceLog::new(true, 2);
        trace.log(|| "one".into());
        trace.log(|| "two".into());
        trace.log(|| "three".into());
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines, vec!["two", "three"]);

        let mut off = TraceLog::new(false, 2);
        off.log(|| panic!("must not render when disabled"));
        assert_eq!(off.lines().count(), 0);
    }
}
