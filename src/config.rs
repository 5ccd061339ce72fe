//! On-disk configuration (spec.md §6's options table), loaded from a
//! TOML file by `comod`'s startup path. Mirrors the teacher's serde-derive
//! style (`sample/config.rs`) but carries this crate's own option set —
//! there's no per-event `PerfEventAttrThingy` here, just the flat options
//! the core consumes plus the sniffer/module lists SUPERVISOR would parse
//! out-of-process in the original system and hand down (spec.md §1 puts
//! the config parser itself out of scope; this is the shape the core's
//! side of that contract takes for a standalone binary).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::error::{CaptureError, Result};

fn default_timebin_ms() -> u64 {
    100
}

fn default_live_threshold_ms() -> u64 {
    50
}

fn default_shmem_min() -> usize {
    1 << 20
}

fn default_shmem_max() -> usize {
    2 << 20
}

fn default_cpu_freq_hz() -> f64 {
    2.5e9
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Minimum size of the process-shared memory region, in bytes.
    #[serde(default = "default_shmem_min")]
    pub shmem_min: usize,
    /// Maximum size of the process-shared memory region, in bytes.
    #[serde(default = "default_shmem_max")]
    pub shmem_max: usize,
    /// Root of EXPORT/STORAGE's on-disk per-module streams; the core
    /// only passes this through (spec.md §1, §6).
    pub db_path: String,
    /// If set, spawn a query immediately after startup and exit once it
    /// completes (spec.md §6).
    #[serde(default)]
    pub inline_mode: bool,
    /// `Δ`, the merge/batch builder's live-threshold, in milliseconds.
    #[serde(default = "default_live_threshold_ms")]
    pub live_threshold_ms: u64,
    /// `W`, the merge/batch builder's bin width, in milliseconds.
    #[serde(default = "default_timebin_ms")]
    pub timebin_ms: u64,
    /// Nominal CPU frequency used by the load-shedding controller to
    /// translate wall-clock time into a cycle budget (Design Note §9:
    /// no portable way to read this at runtime, so it's configured).
    #[serde(default = "default_cpu_freq_hz")]
    pub cpu_freq_hz: f64,
    #[serde(default)]
    pub sniffers: Vec<SnifferConfig>,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SnifferConfig {
    pub driver: String,
    pub device: String,
    #[serde(default)]
    pub args: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    pub binary: String,
    /// The filter expression as the user wrote it; compiled by an
    /// external collaborator (spec.md Design Note §9) before it reaches
    /// the core as a `FilterExpr`.
    pub filter: String,
    pub flush_interval_secs: u64,
    #[serde(default)]
    pub shedding_method: SheddingMethodConfig,
    #[serde(default)]
    pub use_shmem: bool,
    #[serde(default)]
    pub args: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SheddingMethodConfig {
    Packet,
    Flow,
    None,
}

impl Default for SheddingMethodConfig {
    fn default() -> Self {
        SheddingMethodConfig::None
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| CaptureError::Config {
            reason: format!("reading {}: {}", path.display(), e),
        })?;
        toml::from_str(&text).map_err(|e| CaptureError::Config {
            reason: format!("parsing {}: {}", path.display(), e),
        })
    }

    pub fn live_threshold(&self) -> Duration {
        Duration::from_millis(self.live_threshold_ms)
    }

    pub fn timebin(&self) -> Duration {
        Duration::from_millis(self.timebin_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let toml = r#"
            db_path = "/var/lib/como"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.timebin_ms, 100);
        assert_eq!(cfg.live_threshold_ms, 50);
        assert!(cfg.sniffers.is_empty());
        assert!(cfg.modules.is_empty());
    }

    #[test]
    fn full_config_round_trips_sniffers_and_modules() {
        let toml = r#"
            db_path = "/var/lib/como"
            shmem_min = 1048576
            shmem_max = 2097152
            timebin_ms = 100
            live_threshold_ms = 50

            [[sniffers]]
            driver = "file"
            device = "/traces/sample.pcap"

            [[modules]]
            name = "tcpstats"
            binary = "tcpstats.so"
            filter = "true"
            flush_interval_secs = 60
            shedding_method = "flow"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.sniffers.len(), 1);
        assert_eq!(cfg.sniffers[0].driver, "file");
        assert_eq!(cfg.modules.len(), 1);
        assert_eq!(cfg.modules[0].shedding_method, SheddingMethodConfig::Flow);
    }

    #[test]
    fn missing_db_path_fails_to_parse() {
        let toml = r#"
            timebin_ms = 100
        "#;
        let result: ::std::result::Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }
}
