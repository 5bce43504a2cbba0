use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Sampler configuration loaded from ~/.config/procsampler/config.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sampler: SamplerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Sampling interval in milliseconds.
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    /// Where samples go: "json" (stdout, one object per line) or "log".
    #[serde(default)]
    pub output: OutputFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            output: OutputFormat::default(),
        }
    }
}

fn default_interval() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Log,
}

/// Limits and tunables for the sampling worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerSettings {
    /// Upper bound on PIDs enumerated per tick.
    #[serde(default = "default_max_pids")]
    pub max_pids: usize,
    /// How many of the enumerated PIDs get a full read each tick.
    #[serde(default = "default_max_detailed_pids")]
    pub max_detailed_pids: usize,
    /// CPU percent is clamped to this value. Above 100 so that
    /// multi-threaded processes can report more than one core.
    #[serde(default = "default_cpu_ceiling")]
    pub cpu_percent_ceiling: f64,
    /// Shortest interval the engine accepts from the host.
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            max_pids: default_max_pids(),
            max_detailed_pids: default_max_detailed_pids(),
            cpu_percent_ceiling: default_cpu_ceiling(),
            min_interval_ms: default_min_interval(),
            proc_root: default_proc_root(),
        }
    }
}

fn default_max_pids() -> usize {
    100
}

fn default_max_detailed_pids() -> usize {
    10
}

fn default_cpu_ceiling() -> f64 {
    1000.0
}

fn default_min_interval() -> u64 {
    1000
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

impl Config {
    /// Load config from the default path, or return defaults if not found.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config from {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("serializing config")?;
        fs::write(path, content).with_context(|| format!("writing config to {}", path.display()))?;
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("procsampler")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.general.interval_ms, 30_000);
        assert_eq!(config.general.output, OutputFormat::Json);
        assert_eq!(config.sampler.max_pids, 100);
        assert_eq!(config.sampler.max_detailed_pids, 10);
        assert_eq!(config.sampler.cpu_percent_ceiling, 1000.0);
        assert_eq!(config.sampler.min_interval_ms, 1000);
        assert_eq!(config.sampler.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sampler]
            max_detailed_pids = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.sampler.max_detailed_pids, 25);
        assert_eq!(config.sampler.max_pids, 100);
        assert_eq!(config.general.interval_ms, 30_000);
    }

    #[test]
    fn output_format_is_lowercase() {
        let config: Config = toml::from_str("[general]\noutput = \"log\"\n").unwrap();
        assert_eq!(config.general.output, OutputFormat::Log);
        assert!(toml::from_str::<Config>("[general]\noutput = \"xml\"\n").is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.general.interval_ms = 5_000;
        config.sampler.cpu_percent_ceiling = 400.0;
        config.sampler.proc_root = PathBuf::from("/tmp/fakeproc");
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.general.interval_ms, 5_000);
        assert_eq!(loaded.sampler.cpu_percent_ceiling, 400.0);
        assert_eq!(loaded.sampler.proc_root, PathBuf::from("/tmp/fakeproc"));
    }

    #[test]
    fn unreadable_file_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing.toml");
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("missing.toml"));
    }
}
