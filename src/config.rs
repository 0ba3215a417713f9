//! Audio output configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::mixer::OutputType;
use crate::constants::DEFAULT_RING_BUFFER_PACKETS;
use crate::error::{Error, Result};

/// Top-level configuration for the audio core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Decoded packets worth of slack the ring buffer holds
    pub ring_buffer_packets: usize,
    /// Output device name; the host default when absent
    pub preferred_device: Option<String>,
    pub spatial: SpatialConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ring_buffer_packets: DEFAULT_RING_BUFFER_PACKETS,
            preferred_device: None,
            spatial: SpatialConfig::default(),
        }
    }
}

/// Spatial mixing preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Virtualize surround streams when the device allows it
    pub enabled: bool,
    pub output_type: OutputType,
    pub personalized_hrtf: bool,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_type: OutputType::Spatial,
            personalized_hrtf: false,
        }
    }
}

impl AudioConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AudioConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Load `audio.toml` from the platform config directory, or defaults if it
    /// does not exist
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading audio config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "gamestream", "gamestream-audio")
            .map(|dirs| dirs.config_dir().join("audio.toml"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ring_buffer_packets < 2 {
            return Err(Error::Config(format!(
                "ring_buffer_packets must be at least 2, got {}",
                self.ring_buffer_packets
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.ring_buffer_packets, DEFAULT_RING_BUFFER_PACKETS);
        assert!(config.spatial.enabled);
        assert_eq!(config.spatial.output_type, OutputType::Spatial);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = AudioConfig::from_toml(
            r#"
            ring_buffer_packets = 12

            [spatial]
            output_type = "head_tracked"
            "#,
        )
        .unwrap();

        assert_eq!(config.ring_buffer_packets, 12);
        assert_eq!(config.spatial.output_type, OutputType::HeadTracked);
        assert!(config.spatial.enabled);
        assert!(config.preferred_device.is_none());
    }

    #[test]
    fn test_rejects_tiny_ring() {
        assert!(matches!(
            AudioConfig::from_toml("ring_buffer_packets = 1"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AudioConfig::default();
        config.preferred_device = Some("USB DAC".into());
        let text = config.to_toml().unwrap();
        assert_eq!(AudioConfig::from_toml(&text).unwrap(), config);
    }
}
