//! Stream and device formats, channel layouts

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::MAX_CHANNELS;
use crate::error::AudioError;

/// Bytes per interleaved sample in the ring buffer (native-endian f32)
pub const BYTES_PER_SAMPLE: usize = 4;

/// Negotiated input format of a streaming session.
///
/// Immutable for the life of a session; a different format means tearing the
/// engine down and preparing again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one decoded packet
    pub samples_per_frame: u32,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, samples_per_frame: u32) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat("sample rate is zero".into()));
        }
        if channels == 0 || channels as usize > MAX_CHANNELS {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels (1..={} supported)",
                channels, MAX_CHANNELS
            )));
        }
        if samples_per_frame == 0 {
            return Err(AudioError::UnsupportedFormat("zero samples per frame".into()));
        }
        Ok(Self {
            sample_rate,
            channels,
            samples_per_frame,
        })
    }

    /// Bytes in one interleaved frame (one sample for every channel)
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Interleaved samples in one decoded packet
    pub fn packet_samples(&self) -> usize {
        self.samples_per_frame as usize * self.channels as usize
    }

    pub fn packet_bytes(&self) -> usize {
        self.packet_samples() * BYTES_PER_SAMPLE
    }

    pub fn packet_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_frame as f64 / self.sample_rate as f64)
    }

    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout::from_channel_count(self.channels)
    }
}

/// Format the hardware callback renders in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputFormat {
    /// True when samples can be copied from `input` without conversion
    pub fn matches(&self, input: &StreamFormat) -> bool {
        self.sample_rate == input.sample_rate && self.channels == input.channels
    }
}

/// Which side of the mixing stage a layout describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Input,
    Output,
}

/// Speaker positions in the order the stream interleaves them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    SideLeft,
    SideRight,
}

impl Speaker {
    /// Horizontal angle in degrees, negative to the left, 0 straight ahead
    pub fn azimuth(&self) -> f32 {
        match self {
            Speaker::FrontLeft => -30.0,
            Speaker::FrontRight => 30.0,
            Speaker::FrontCenter => 0.0,
            Speaker::LowFrequency => 0.0,
            Speaker::BackLeft => -150.0,
            Speaker::BackRight => 150.0,
            Speaker::SideLeft => -110.0,
            Speaker::SideRight => 110.0,
        }
    }

    pub fn is_lfe(&self) -> bool {
        matches!(self, Speaker::LowFrequency)
    }
}

/// Channel layout tags understood by the mixing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Quad,
    Surround51,
    Surround71,
    /// Channel count with no known speaker mapping
    Discrete(u16),
}

impl ChannelLayout {
    pub fn from_channel_count(channels: u16) -> Self {
        match channels {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            4 => ChannelLayout::Quad,
            6 => ChannelLayout::Surround51,
            8 => ChannelLayout::Surround71,
            n => ChannelLayout::Discrete(n),
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Quad => 4,
            ChannelLayout::Surround51 => 6,
            ChannelLayout::Surround71 => 8,
            ChannelLayout::Discrete(n) => *n,
        }
    }

    /// Speakers in stream order; empty for discrete layouts
    pub fn speakers(&self) -> &'static [Speaker] {
        use Speaker::*;
        match self {
            ChannelLayout::Mono => &[FrontCenter],
            ChannelLayout::Stereo => &[FrontLeft, FrontRight],
            ChannelLayout::Quad => &[FrontLeft, FrontRight, BackLeft, BackRight],
            ChannelLayout::Surround51 => &[FrontLeft, FrontRight, FrontCenter, LowFrequency, BackLeft, BackRight],
            ChannelLayout::Surround71 => &[
                FrontLeft,
                FrontRight,
                FrontCenter,
                LowFrequency,
                BackLeft,
                BackRight,
                SideLeft,
                SideRight,
            ],
            ChannelLayout::Discrete(_) => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_format_sizes() {
        let format = StreamFormat::new(48000, 2, 960).unwrap();
        assert_eq!(format.frame_bytes(), 8);
        assert_eq!(format.packet_samples(), 1920);
        assert_eq!(format.packet_bytes(), 7680);
        assert_eq!(format.packet_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_stream_format_rejects_invalid() {
        assert!(StreamFormat::new(0, 2, 240).is_err());
        assert!(StreamFormat::new(48000, 0, 240).is_err());
        assert!(StreamFormat::new(48000, 12, 240).is_err());
        assert!(StreamFormat::new(48000, 2, 0).is_err());
    }

    #[test]
    fn test_layout_speakers_match_channels() {
        for layout in [
            ChannelLayout::Mono,
            ChannelLayout::Stereo,
            ChannelLayout::Quad,
            ChannelLayout::Surround51,
            ChannelLayout::Surround71,
        ] {
            assert_eq!(layout.speakers().len(), layout.channels() as usize);
            assert_eq!(ChannelLayout::from_channel_count(layout.channels()), layout);
        }
        assert!(ChannelLayout::Discrete(3).speakers().is_empty());
    }
}
