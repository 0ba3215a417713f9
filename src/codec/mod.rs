//! Opus stream description and decoding into the renderer
//!
//! The session layer negotiates an Opus multistream configuration with the
//! host; the audio core derives its [`StreamFormat`] from it.

pub mod decoder;

pub use decoder::OpusDecoder;

use serde::{Deserialize, Serialize};

use crate::audio::format::StreamFormat;
use crate::constants::{DEFAULT_SAMPLES_PER_FRAME, DEFAULT_SAMPLE_RATE, MAX_CHANNELS};
use crate::error::AudioError;

/// Negotiated Opus multistream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpusMultistreamConfig {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub streams: u8,
    pub coupled_streams: u8,
    /// Samples per channel in one packet
    pub samples_per_frame: u32,
    /// Output channel to decoded stream channel
    pub mapping: [u8; MAX_CHANNELS],
}

impl OpusMultistreamConfig {
    pub fn stereo() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channel_count: 2,
            streams: 1,
            coupled_streams: 1,
            samples_per_frame: DEFAULT_SAMPLES_PER_FRAME,
            mapping: [0, 1, 0, 0, 0, 0, 0, 0],
        }
    }

    pub fn surround51() -> Self {
        Self {
            channel_count: 6,
            streams: 4,
            coupled_streams: 2,
            mapping: [0, 4, 1, 5, 2, 3, 0, 0],
            ..Self::stereo()
        }
    }

    pub fn surround71() -> Self {
        Self {
            channel_count: 8,
            streams: 5,
            coupled_streams: 3,
            mapping: [0, 6, 1, 7, 2, 3, 4, 5],
            ..Self::stereo()
        }
    }

    pub fn validate(&self) -> Result<(), AudioError> {
        if self.channel_count == 0 || self.channel_count as usize > MAX_CHANNELS {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels",
                self.channel_count
            )));
        }
        if self.streams == 0 || self.coupled_streams > self.streams {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} streams with {} coupled",
                self.streams, self.coupled_streams
            )));
        }
        let decoded_channels = self.streams as u16 + self.coupled_streams as u16;
        if decoded_channels != self.channel_count {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} streams + {} coupled do not make {} channels",
                self.streams, self.coupled_streams, self.channel_count
            )));
        }
        let mapping = &self.mapping[..self.channel_count as usize];
        if let Some(bad) = mapping.iter().find(|&&m| m != 255 && m as u16 >= decoded_channels) {
            return Err(AudioError::UnsupportedFormat(format!("mapping entry {}", bad)));
        }
        Ok(())
    }
}

impl TryFrom<&OpusMultistreamConfig> for StreamFormat {
    type Error = AudioError;

    fn try_from(config: &OpusMultistreamConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        StreamFormat::new(config.sample_rate, config.channel_count, config.samples_per_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            OpusMultistreamConfig::stereo(),
            OpusMultistreamConfig::surround51(),
            OpusMultistreamConfig::surround71(),
        ] {
            assert!(config.validate().is_ok());
            let format = StreamFormat::try_from(&config).unwrap();
            assert_eq!(format.channels, config.channel_count);
            assert_eq!(format.samples_per_frame, DEFAULT_SAMPLES_PER_FRAME);
        }
    }

    #[test]
    fn test_inconsistent_streams_rejected() {
        let mut config = OpusMultistreamConfig::surround51();
        config.coupled_streams = 1;
        assert!(StreamFormat::try_from(&config).is_err());

        let mut config = OpusMultistreamConfig::stereo();
        config.mapping[1] = 9;
        assert!(config.validate().is_err());
    }
}
