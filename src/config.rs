//! Configuration Module
//!
//! Handles configuration file parsing and the `PVGPU_DEBUG` environment
//! variable.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::debug::DebugFlags;
use crate::device::DeviceCaps;
use crate::protocol::{PVGPU_DEFAULT_CMDBUF_SIZE, PVGPU_DEFAULT_MAX_RELOCS};
use crate::screen::ScreenOptions;

/// Winsys configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Command buffer capacity in bytes
    #[serde(default = "default_command_buffer_size")]
    pub command_buffer_size: usize,

    /// Relocations per command buffer
    #[serde(default = "default_max_relocations")]
    pub max_relocations: usize,

    /// Debug flag names, e.g. "reloc,flush" or "all"
    #[serde(default)]
    pub debug: String,

    /// Device memory budget in MB
    #[serde(default = "default_device_memory_mb")]
    pub device_memory_mb: u64,

    /// Log filter used when RUST_LOG is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Frames rendered by the demo binary (0 = until Ctrl+C)
    #[serde(default = "default_demo_frames")]
    pub demo_frames: u32,

    /// Loopback device completion latency in milliseconds
    #[serde(default = "default_completion_latency_ms")]
    pub completion_latency_ms: u64,

    /// Evict every resource every N demo frames (0 = never)
    #[serde(default = "default_evict_interval")]
    pub evict_interval: u32,
}

fn default_command_buffer_size() -> usize {
    PVGPU_DEFAULT_CMDBUF_SIZE
}

fn default_max_relocations() -> usize {
    PVGPU_DEFAULT_MAX_RELOCS
}

fn default_device_memory_mb() -> u64 {
    256
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_demo_frames() -> u32 {
    120
}

fn default_completion_latency_ms() -> u64 {
    2
}

fn default_evict_interval() -> u32 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_buffer_size: default_command_buffer_size(),
            max_relocations: default_max_relocations(),
            debug: String::new(),
            device_memory_mb: default_device_memory_mb(),
            log_filter: default_log_filter(),
            demo_frames: default_demo_frames(),
            completion_latency_ms: default_completion_latency_ms(),
            evict_interval: default_evict_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_buffer_size < 256 || self.command_buffer_size % 16 != 0 {
            anyhow::bail!(
                "command_buffer_size must be a multiple of 16 of at least 256, got {}",
                self.command_buffer_size
            );
        }
        if self.max_relocations == 0 {
            anyhow::bail!("max_relocations must be positive");
        }
        Ok(())
    }

    /// Configured debug flags, plus any named in `PVGPU_DEBUG`.
    pub fn debug_flags(&self) -> DebugFlags {
        DebugFlags::parse(&self.debug) | DebugFlags::from_env()
    }

    pub fn device_caps(&self) -> DeviceCaps {
        DeviceCaps {
            memory_budget: self.device_memory_mb.saturating_mul(1024 * 1024),
            ..DeviceCaps::default()
        }
    }

    pub fn completion_latency(&self) -> Duration {
        Duration::from_millis(self.completion_latency_ms)
    }

    pub fn screen_options(&self) -> ScreenOptions {
        ScreenOptions {
            command_buffer_size: self.command_buffer_size,
            max_relocations: self.max_relocations,
            debug: self.debug_flags(),
            ..ScreenOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.command_buffer_size, PVGPU_DEFAULT_CMDBUF_SIZE);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvgpu.toml");
        let config = Config {
            debug: "reloc,flush".to_string(),
            demo_frames: 10,
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
        assert!(config.debug_flags().contains(DebugFlags::RELOC | DebugFlags::FLUSH));
    }

    #[test]
    fn test_rejects_bad_buffer_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvgpu.toml");
        std::fs::write(&path, "command_buffer_size = 100\n").unwrap();
        assert!(Config::load(&path).is_err());
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_screen_options() {
        let config = Config {
            command_buffer_size: 4096,
            device_memory_mb: 16,
            ..Config::default()
        };
        assert_eq!(config.screen_options().command_buffer_size, 4096);
        assert_eq!(config.device_caps().memory_budget, 16 * 1024 * 1024);
    }
}
