//! Opus decoder feeding the audio renderer
//!
//! Decodes straight into the renderer's write region so a packet never
//! passes through an intermediate allocation.

use std::time::Instant;

use opus::{Channels, Decoder};

use super::OpusMultistreamConfig;
use crate::audio::renderer::AudioRenderer;
use crate::error::CodecError;
use crate::stats::AudioStats;

/// Opus decoder wrapper
///
/// Only single-stream mono and stereo layouts are decodable; surround
/// sessions need a multistream decoder.
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    samples_per_frame: usize,
    frames_decoded: u64,
    frames_concealed: u64,
}

impl OpusDecoder {
    pub fn new(config: &OpusMultistreamConfig) -> Result<Self, CodecError> {
        let opus_channels = match (config.channel_count, config.streams) {
            (1, 1) => Channels::Mono,
            (2, 1) => Channels::Stereo,
            _ => return Err(CodecError::UnsupportedChannels(config.channel_count)),
        };

        let decoder = Decoder::new(config.sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_rate: config.sample_rate,
            channels: config.channel_count,
            samples_per_frame: config.samples_per_frame as usize,
            frames_decoded: 0,
            frames_concealed: 0,
        })
    }

    /// Decode one packet into `out`, or conceal a lost one when `packet` is
    /// `None`. Returns the interleaved sample count written.
    pub fn decode_into(&mut self, packet: Option<&[u8]>, out: &mut [f32]) -> Result<usize, CodecError> {
        let needed = self.samples_per_frame * self.channels as usize;
        if out.len() < needed {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        // PLC has to be asked for exactly one frame
        let (input, out) = match packet {
            Some(data) => (data, out),
            None => (&[][..], &mut out[..needed]),
        };

        let frames = self
            .decoder
            .decode_float(input, out, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        if packet.is_some() {
            self.frames_decoded += 1;
        } else {
            self.frames_concealed += 1;
        }

        Ok(frames * self.channels as usize)
    }

    /// Decode a packet into the renderer and submit it
    ///
    /// Returns `Ok(false)` when the renderer has no room or is not prepared;
    /// the packet is dropped in that case.
    pub fn decode_to_renderer(
        &mut self,
        packet: Option<&[u8]>,
        renderer: &mut AudioRenderer,
        stats: &AudioStats,
    ) -> Result<bool, CodecError> {
        if let Some(data) = packet {
            stats.record_packet_received(data.len());
        }

        let started = Instant::now();
        let written = match renderer.get_audio_buffer() {
            Some(buffer) => self.decode_into(packet, buffer)?,
            None => {
                stats.record_dropped(self.samples_per_frame * self.channels as usize);
                return Ok(false);
            }
        };

        if packet.is_some() {
            stats.record_decoded(written, started.elapsed());
        } else {
            // Concealed audio still plays, but counts as lost
            stats.record_dropped(written);
        }

        Ok(renderer.submit_audio(written))
    }

    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_concealed(&self) -> u64 {
        self.frames_concealed
    }
}
