//! Spatial mixing stage
//!
//! Pulls interleaved frames from an attached ring buffer, converts the sample
//! rate when input and device differ, and maps input channels onto the device's
//! output channels through a gain matrix. In spatial modes the matrix places
//! each input speaker around a virtual listener; in head-tracked mode the
//! placement follows the listener's yaw.
//!
//! State machine:
//!
//! ```text
//! Uninitialized --configure--> Configured --attach_source--> Ready
//! Ready --begin_rendering--> Rendering --end_rendering--> Ready
//! ```
//!
//! `configure`, `set_output_type` and layout changes are rejected in
//! `Rendering`. The render path itself never allocates, locks or blocks.

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::audio::buffer::RingReader;
use crate::audio::device::DeviceProfile;
use crate::audio::format::{ChannelLayout, Scope, Speaker, BYTES_PER_SAMPLE};
use crate::audio::output::{RenderStatus, RenderTimestamp};
use crate::audio::registry::{SourceHandle, SourceRegistry};
use crate::constants::MAX_CHANNELS;
use crate::error::MixerError;

type GainMatrix = [[f32; MAX_CHANNELS]; MAX_CHANNELS];

/// How the stage presents the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// Plain channel mapping or downmix, no virtualization
    Stereo,
    /// Virtualized surround around a fixed listener
    Spatial,
    /// Virtualized surround that follows head orientation
    HeadTracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    Uninitialized,
    Configured,
    Ready,
    Rendering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialMixerConfig {
    pub output_type: OutputType,
    pub head_tracking: bool,
    pub personalized_hrtf: bool,
}

impl SpatialMixerConfig {
    fn for_output_type(output_type: OutputType, personalized_hrtf: bool) -> Self {
        Self {
            output_type,
            head_tracking: output_type == OutputType::HeadTracked,
            personalized_hrtf,
        }
    }
}

/// Listener yaw shared with a head tracker on another thread
#[derive(Clone, Default)]
pub struct HeadOrientation {
    yaw_bits: Arc<AtomicU32>,
}

impl HeadOrientation {
    /// Set yaw in radians, positive turning right
    pub fn set_yaw(&self, radians: f32) {
        self.yaw_bits.store(radians.to_bits(), Ordering::Relaxed);
    }

    pub fn yaw(&self) -> f32 {
        f32::from_bits(self.yaw_bits.load(Ordering::Relaxed))
    }

    fn bits(&self) -> u32 {
        self.yaw_bits.load(Ordering::Relaxed)
    }
}

/// Linear interpolating sample-rate converter with one frame of lookahead
struct LinearResampler {
    step: f64,
    phase: f64,
    prev: [f32; MAX_CHANNELS],
    next: [f32; MAX_CHANNELS],
    primed: bool,
}

impl LinearResampler {
    fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            step: input_rate as f64 / output_rate as f64,
            phase: 0.0,
            prev: [0.0; MAX_CHANNELS],
            next: [0.0; MAX_CHANNELS],
            primed: false,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Produce one output frame, pulling input frames through `pull` as needed.
    /// Returns false if any pull came up empty.
    fn next_frame<F>(&mut self, channels: usize, out: &mut [f32], mut pull: F) -> bool
    where
        F: FnMut(&mut [f32]) -> bool,
    {
        let mut complete = true;
        if !self.primed {
            complete &= pull(&mut self.prev[..channels]);
            complete &= pull(&mut self.next[..channels]);
            self.primed = true;
        }

        let t = self.phase as f32;
        for ch in 0..channels {
            out[ch] = self.prev[ch] + (self.next[ch] - self.prev[ch]) * t;
        }

        self.phase += self.step;
        while self.phase >= 1.0 {
            self.prev = self.next;
            complete &= pull(&mut self.next[..channels]);
            self.phase -= 1.0;
        }
        complete
    }
}

/// Spatial mixing stage between the ring buffer and the hardware output
pub struct SpatialMixer {
    device: DeviceProfile,
    state: MixerState,
    config: SpatialMixerConfig,
    input_rate: u32,
    output_rate: u32,
    input_channels: u16,
    output_channels: u16,
    input_layout: Option<ChannelLayout>,
    output_layout: ChannelLayout,
    source: Option<SourceHandle>,
    gains: GainMatrix,
    /// Unity mapping; samples pass through without clamping
    passthrough: bool,
    head: HeadOrientation,
    applied_yaw_bits: u32,
    resampler: LinearResampler,
    latency: f64,
}

impl SpatialMixer {
    pub fn new(device: DeviceProfile) -> Self {
        let output_channels = device.output_channels;
        Self {
            state: MixerState::Uninitialized,
            config: SpatialMixerConfig::for_output_type(OutputType::Stereo, false),
            input_rate: device.sample_rate,
            output_rate: device.sample_rate,
            input_channels: 0,
            output_channels,
            input_layout: None,
            output_layout: ChannelLayout::from_channel_count(output_channels),
            source: None,
            gains: [[0.0; MAX_CHANNELS]; MAX_CHANNELS],
            passthrough: false,
            head: HeadOrientation::default(),
            applied_yaw_bits: 0,
            resampler: LinearResampler::new(1, 1),
            latency: 0.0,
            device,
        }
    }

    /// Build or rebuild the stage.
    ///
    /// On failure the previous configuration stays in effect.
    pub fn configure(
        &mut self,
        output_type: OutputType,
        input_rate: u32,
        output_rate: u32,
        input_channels: u16,
    ) -> Result<(), MixerError> {
        self.ensure_not_rendering("configure")?;

        if input_rate == 0 || output_rate == 0 {
            return Err(MixerError::InvalidFormat("sample rate is zero".into()));
        }
        if input_channels == 0 || input_channels as usize > MAX_CHANNELS {
            return Err(MixerError::InvalidFormat(format!("{} input channels", input_channels)));
        }
        if self.output_channels == 0 || self.output_channels as usize > MAX_CHANNELS {
            return Err(MixerError::InvalidFormat(format!(
                "{} output channels",
                self.output_channels
            )));
        }
        self.check_supported(output_type)?;

        if input_channels != self.input_channels {
            self.input_layout = None;
        }
        self.config = SpatialMixerConfig::for_output_type(output_type, self.config.personalized_hrtf);
        self.input_rate = input_rate;
        self.output_rate = output_rate;
        self.input_channels = input_channels;
        self.resampler = LinearResampler::new(input_rate, output_rate);
        self.latency = self.compute_latency();
        self.rebuild_gains();

        if self.state == MixerState::Uninitialized {
            self.state = MixerState::Configured;
        }
        tracing::debug!(
            "Spatial mixer configured: {:?}, {} Hz x {} ch -> {} Hz x {} ch",
            output_type,
            input_rate,
            input_channels,
            output_rate,
            self.output_channels
        );
        Ok(())
    }

    /// Apply channel-layout metadata for one side of the stage
    pub fn set_stream_format_and_layout(
        &mut self,
        sample_rate: u32,
        layout: ChannelLayout,
        scope: Scope,
    ) -> Result<(), MixerError> {
        self.ensure_not_rendering("set stream format")?;
        if self.state == MixerState::Uninitialized {
            return Err(MixerError::InvalidState {
                state: self.state,
                operation: "set stream format",
            });
        }

        let (expected_channels, expected_rate) = match scope {
            Scope::Input => (self.input_channels, self.input_rate),
            Scope::Output => (self.output_channels, self.output_rate),
        };
        if layout.channels() != expected_channels {
            return Err(MixerError::LayoutMismatch {
                layout: layout.channels(),
                expected: expected_channels,
            });
        }
        if sample_rate != expected_rate {
            return Err(MixerError::InvalidFormat(format!(
                "{:?} scope runs at {} Hz, not {} Hz",
                scope, expected_rate, sample_rate
            )));
        }

        match scope {
            Scope::Input => self.input_layout = Some(layout),
            Scope::Output => self.output_layout = layout,
        }
        self.rebuild_gains();
        Ok(())
    }

    /// Record which registered ring buffer the stage pulls from
    pub fn attach_source(&mut self, source: SourceHandle) -> Result<(), MixerError> {
        match self.state {
            MixerState::Uninitialized | MixerState::Rendering => Err(MixerError::InvalidState {
                state: self.state,
                operation: "attach source",
            }),
            MixerState::Configured | MixerState::Ready => {
                self.source = Some(source);
                self.state = MixerState::Ready;
                Ok(())
            }
        }
    }

    pub fn source(&self) -> Option<SourceHandle> {
        self.source
    }

    /// Switch presentation; only while not rendering
    pub fn set_output_type(&mut self, output_type: OutputType) -> Result<(), MixerError> {
        self.ensure_not_rendering("set output type")?;
        if self.state == MixerState::Uninitialized {
            return Err(MixerError::InvalidState {
                state: self.state,
                operation: "set output type",
            });
        }
        self.check_supported(output_type)?;

        self.config = SpatialMixerConfig::for_output_type(output_type, self.config.personalized_hrtf);
        self.rebuild_gains();
        tracing::info!("Spatial mixer output type set to {:?}", output_type);
        Ok(())
    }

    pub fn set_personalized_hrtf(&mut self, enabled: bool) -> Result<(), MixerError> {
        self.ensure_not_rendering("set personalized HRTF")?;
        self.config.personalized_hrtf = enabled;
        Ok(())
    }

    pub fn begin_rendering(&mut self) -> Result<(), MixerError> {
        if self.state != MixerState::Ready {
            return Err(MixerError::InvalidState {
                state: self.state,
                operation: "begin rendering",
            });
        }
        self.state = MixerState::Rendering;
        Ok(())
    }

    pub fn end_rendering(&mut self) {
        if self.state == MixerState::Rendering {
            self.state = MixerState::Ready;
        }
    }

    pub fn state(&self) -> MixerState {
        self.state
    }

    pub fn config(&self) -> SpatialMixerConfig {
        self.config
    }

    pub fn output_type(&self) -> OutputType {
        self.config.output_type
    }

    pub fn output_channels(&self) -> u16 {
        self.output_channels
    }

    pub fn input_channels(&self) -> u16 {
        self.input_channels
    }

    /// Handle for feeding listener orientation in head-tracked mode
    pub fn head_orientation(&self) -> HeadOrientation {
        self.head.clone()
    }

    /// Processing plus output latency in seconds; no allocation
    pub fn latency_seconds(&self) -> f64 {
        self.latency
    }

    /// Render `frames` output frames into `output`.
    ///
    /// Called from the hardware callback. On underrun the rest of the buffer is
    /// silence and [`RenderStatus::Underrun`] is returned.
    pub fn render(
        &mut self,
        registry: &mut SourceRegistry,
        output: &mut [f32],
        _timestamp: &RenderTimestamp,
        frames: usize,
    ) -> RenderStatus {
        let out_channels = self.output_channels as usize;
        let frames = frames.min(output.len() / out_channels.max(1));
        let output = &mut output[..frames * out_channels];

        if !matches!(self.state, MixerState::Ready | MixerState::Rendering) || self.input_layout.is_none() {
            output.fill(0.0);
            return RenderStatus::NotReady;
        }
        let Some(reader) = self.source.and_then(|handle| registry.get_mut(handle)) else {
            output.fill(0.0);
            return RenderStatus::SourceDetached;
        };

        if self.config.head_tracking && self.head.bits() != self.applied_yaw_bits {
            self.rebuild_gains();
        }

        let in_channels = self.input_channels as usize;
        let mut frame = [0.0f32; MAX_CHANNELS];
        let mut scratch = [0u8; MAX_CHANNELS * BYTES_PER_SAMPLE];
        let mut underrun = false;

        for out_frame in output.chunks_exact_mut(out_channels) {
            if underrun {
                out_frame.fill(0.0);
                continue;
            }

            let complete = if self.resampler.is_passthrough() {
                pull_frame(reader, &mut scratch, &mut frame[..in_channels])
            } else {
                self.resampler
                    .next_frame(in_channels, &mut frame, |dst| pull_frame(reader, &mut scratch, dst))
            };
            if !complete {
                underrun = true;
                out_frame.fill(0.0);
                continue;
            }

            for (o, sample) in out_frame.iter_mut().enumerate() {
                let row = &self.gains[o];
                let mut acc = 0.0f32;
                for i in 0..in_channels {
                    acc += row[i] * frame[i];
                }
                *sample = if self.passthrough { acc } else { acc.clamp(-1.0, 1.0) };
            }
        }

        if underrun {
            RenderStatus::Underrun
        } else {
            RenderStatus::Rendered
        }
    }

    fn ensure_not_rendering(&self, operation: &'static str) -> Result<(), MixerError> {
        if self.state == MixerState::Rendering {
            return Err(MixerError::InvalidState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn check_supported(&self, output_type: OutputType) -> Result<(), MixerError> {
        let supported = match output_type {
            OutputType::Stereo => true,
            OutputType::Spatial => self.device.supports_spatial(),
            OutputType::HeadTracked => self.device.supports_spatial() && self.device.supports_head_tracking,
        };
        if supported {
            Ok(())
        } else {
            Err(MixerError::UnsupportedOutputType(output_type))
        }
    }

    fn compute_latency(&self) -> f64 {
        let conversion = if self.input_rate != self.output_rate {
            1.0 / self.input_rate as f64
        } else {
            0.0
        };
        conversion + self.device.hardware_latency + self.device.software_latency_min
    }

    fn rebuild_gains(&mut self) {
        let yaw_bits = self.head.bits();
        let yaw = if self.config.head_tracking {
            f32::from_bits(yaw_bits).to_degrees()
        } else {
            0.0
        };
        let input = self
            .input_layout
            .unwrap_or_else(|| ChannelLayout::from_channel_count(self.input_channels));

        self.gains = build_gains(self.config.output_type, input, self.output_layout, yaw);
        self.passthrough =
            self.input_channels == self.output_channels && is_identity(&self.gains, self.input_channels as usize);
        self.applied_yaw_bits = yaw_bits;
    }
}

fn pull_frame(reader: &mut RingReader, scratch: &mut [u8], frame: &mut [f32]) -> bool {
    let bytes = &mut scratch[..frame.len() * BYTES_PER_SAMPLE];
    if !reader.pop_exact(bytes) {
        frame.fill(0.0);
        return false;
    }
    for (sample, chunk) in frame.iter_mut().zip(bytes.chunks_exact(BYTES_PER_SAMPLE)) {
        *sample = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    true
}

fn build_gains(output_type: OutputType, input: ChannelLayout, output: ChannelLayout, yaw_degrees: f32) -> GainMatrix {
    let mut gains = [[0.0f32; MAX_CHANNELS]; MAX_CHANNELS];
    let in_ch = input.channels() as usize;
    let out_ch = output.channels() as usize;

    if out_ch == 1 {
        let n = input.speakers().iter().filter(|s| !s.is_lfe()).count().max(1);
        let speakers = input.speakers();
        for i in 0..in_ch {
            let lfe = speakers.get(i).map(Speaker::is_lfe).unwrap_or(false);
            gains[0][i] = if lfe { 0.0 } else { 1.0 / n as f32 };
        }
        return gains;
    }

    let spatial = output_type != OutputType::Stereo;

    if !spatial && in_ch == out_ch {
        identity(&mut gains, in_ch);
        return gains;
    }

    if input.speakers().is_empty() || (out_ch > 2 && output.speakers().is_empty()) {
        // No speaker positions to work from: map channel to channel
        identity(&mut gains, in_ch.min(out_ch));
        if out_ch == 2 {
            for i in 2..in_ch {
                gains[i % 2][i] = FRAC_1_SQRT_2;
            }
        }
        return gains;
    }

    if in_ch == 1 {
        let level = if spatial { FRAC_1_SQRT_2 } else { 1.0 };
        gains[0][0] = level;
        gains[1][0] = level;
        return gains;
    }

    if out_ch == 2 {
        if spatial {
            virtualize_to_stereo(&mut gains, input, yaw_degrees);
        } else {
            downmix_to_stereo(&mut gains, input);
        }
        return gains;
    }

    // Multichannel output: route each input speaker to the matching or nearest
    // output speaker after rotating by yaw
    let outputs = output.speakers();
    for (i, speaker) in input.speakers().iter().enumerate() {
        if speaker.is_lfe() {
            if let Some(o) = outputs.iter().position(Speaker::is_lfe) {
                gains[o][i] = 1.0;
            }
            continue;
        }
        if yaw_degrees == 0.0 {
            if let Some(o) = outputs.iter().position(|s| s == speaker) {
                gains[o][i] = 1.0;
                continue;
            }
        }
        let azimuth = speaker.azimuth() - yaw_degrees;
        let nearest = outputs
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_lfe())
            .min_by(|(_, a), (_, b)| {
                angular_distance(a.azimuth(), azimuth).total_cmp(&angular_distance(b.azimuth(), azimuth))
            })
            .map(|(o, _)| o);
        if let Some(o) = nearest {
            gains[o][i] = 1.0;
        }
    }
    gains
}

fn identity(gains: &mut GainMatrix, channels: usize) {
    for (i, row) in gains.iter_mut().enumerate().take(channels) {
        row[i] = 1.0;
    }
}

fn is_identity(gains: &GainMatrix, channels: usize) -> bool {
    gains
        .iter()
        .take(channels)
        .enumerate()
        .all(|(o, row)| row[..channels].iter().enumerate().all(|(i, &g)| g == if i == o { 1.0 } else { 0.0 }))
}

fn angular_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// ITU-style fold-down with the LFE dropped, normalized to avoid clipping
fn downmix_to_stereo(gains: &mut GainMatrix, input: ChannelLayout) {
    for (i, speaker) in input.speakers().iter().enumerate() {
        let (left, right) = match speaker {
            Speaker::FrontLeft => (1.0, 0.0),
            Speaker::FrontRight => (0.0, 1.0),
            Speaker::FrontCenter => (FRAC_1_SQRT_2, FRAC_1_SQRT_2),
            Speaker::LowFrequency => (0.0, 0.0),
            Speaker::BackLeft | Speaker::SideLeft => (FRAC_1_SQRT_2, 0.0),
            Speaker::BackRight | Speaker::SideRight => (0.0, FRAC_1_SQRT_2),
        };
        gains[0][i] = left;
        gains[1][i] = right;
    }
    normalize_rows(gains, 2);
}

/// Place each speaker around the listener with equal-power panning; sources
/// behind the listener are attenuated and the LFE feeds both ears
fn virtualize_to_stereo(gains: &mut GainMatrix, input: ChannelLayout, yaw_degrees: f32) {
    for (i, speaker) in input.speakers().iter().enumerate() {
        if speaker.is_lfe() {
            gains[0][i] = 0.5;
            gains[1][i] = 0.5;
            continue;
        }
        let azimuth = (speaker.azimuth() - yaw_degrees).to_radians();
        let pan = azimuth.sin();
        let angle = (pan + 1.0) * FRAC_PI_4;
        let front = 0.5 * (1.0 + azimuth.cos());
        let weight = 0.6 + 0.4 * front;
        gains[0][i] = angle.cos() * weight;
        gains[1][i] = angle.sin() * weight;
    }
    normalize_rows(gains, 2);
}

fn normalize_rows(gains: &mut GainMatrix, rows: usize) {
    let peak = gains
        .iter()
        .take(rows)
        .map(|row| row.iter().sum::<f32>())
        .fold(1.0f32, f32::max);
    for row in gains.iter_mut().take(rows) {
        for g in row.iter_mut() {
            *g /= peak;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{samples_as_bytes, RingBuffer, RingWriter};
    use crate::audio::device::TransportType;

    fn device(channels: u16, head_tracking: bool) -> DeviceProfile {
        DeviceProfile {
            name: "Test Headphones".into(),
            transport: TransportType::Bluetooth,
            data_source: Some("hdpn".into()),
            output_channels: channels,
            supported_channels: vec![channels],
            sample_rate: 48000,
            supported_sample_rates: vec![44100, 48000],
            hardware_latency: 0.004,
            software_latency_min: 0.002,
            software_latency_max: 0.02,
            supports_head_tracking: head_tracking,
        }
    }

    fn write_frames(writer: &mut RingWriter, samples: &[f32]) {
        let mut bytes = vec![0u8; samples.len() * 4];
        samples_as_bytes(samples, &mut bytes);
        assert!(writer.write(&bytes));
    }

    fn ready_mixer(
        output_type: OutputType,
        in_channels: u16,
        dev: DeviceProfile,
    ) -> (SpatialMixer, SourceRegistry, RingWriter) {
        let mut mixer = SpatialMixer::new(dev);
        mixer.configure(output_type, 48000, 48000, in_channels).unwrap();
        mixer
            .set_stream_format_and_layout(48000, ChannelLayout::from_channel_count(in_channels), Scope::Input)
            .unwrap();

        let (writer, reader) = RingBuffer::with_capacity(48000 * 4 * in_channels as usize);
        let mut registry = SourceRegistry::new();
        let handle = registry.insert(reader);
        mixer.attach_source(handle).unwrap();
        (mixer, registry, writer)
    }

    #[test]
    fn test_state_machine() {
        let mut mixer = SpatialMixer::new(device(2, false));
        assert_eq!(mixer.state(), MixerState::Uninitialized);
        assert!(mixer.begin_rendering().is_err());

        mixer.configure(OutputType::Spatial, 48000, 48000, 6).unwrap();
        assert_eq!(mixer.state(), MixerState::Configured);

        let mut registry = SourceRegistry::new();
        let (_w, reader) = RingBuffer::with_capacity(64);
        mixer.attach_source(registry.insert(reader)).unwrap();
        assert_eq!(mixer.state(), MixerState::Ready);

        mixer.begin_rendering().unwrap();
        assert_eq!(mixer.state(), MixerState::Rendering);
        assert!(mixer.configure(OutputType::Stereo, 48000, 48000, 2).is_err());

        mixer.end_rendering();
        assert_eq!(mixer.state(), MixerState::Ready);
    }

    #[test]
    fn test_unsupported_output_type_keeps_previous() {
        let mut mixer = SpatialMixer::new(device(2, false));
        mixer.configure(OutputType::Spatial, 48000, 48000, 6).unwrap();

        let err = mixer.configure(OutputType::HeadTracked, 44100, 48000, 2).unwrap_err();
        assert_eq!(err, MixerError::UnsupportedOutputType(OutputType::HeadTracked));
        assert_eq!(mixer.output_type(), OutputType::Spatial);
        assert_eq!(mixer.input_channels(), 6);
        assert!((mixer.latency_seconds() - 0.006).abs() < 1e-12);

        let mut mono_device = SpatialMixer::new(device(1, false));
        assert!(mono_device.configure(OutputType::Spatial, 48000, 48000, 2).is_err());
        assert!(mono_device.configure(OutputType::Stereo, 48000, 48000, 2).is_ok());
    }

    #[test]
    fn test_layout_must_match_configuration() {
        let mut mixer = SpatialMixer::new(device(2, false));
        assert!(mixer
            .set_stream_format_and_layout(48000, ChannelLayout::Stereo, Scope::Input)
            .is_err());

        mixer.configure(OutputType::Spatial, 48000, 48000, 6).unwrap();
        assert_eq!(
            mixer.set_stream_format_and_layout(48000, ChannelLayout::Surround71, Scope::Input),
            Err(MixerError::LayoutMismatch { layout: 8, expected: 6 })
        );
        assert!(mixer
            .set_stream_format_and_layout(44100, ChannelLayout::Surround51, Scope::Input)
            .is_err());
        assert!(mixer
            .set_stream_format_and_layout(48000, ChannelLayout::Surround51, Scope::Input)
            .is_ok());
    }

    #[test]
    fn test_render_without_layout_is_silent() {
        let mut mixer = SpatialMixer::new(device(2, false));
        mixer.configure(OutputType::Stereo, 48000, 48000, 2).unwrap();
        let mut registry = SourceRegistry::new();
        let (mut writer, reader) = RingBuffer::with_capacity(64);
        write_frames(&mut writer, &[0.5; 8]);
        mixer.attach_source(registry.insert(reader)).unwrap();

        let mut out = [1.0f32; 8];
        let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 4);
        assert_eq!(status, RenderStatus::NotReady);
        assert_eq!(out, [0.0; 8]);
    }

    #[test]
    fn test_stereo_passthrough_is_exact() {
        let (mut mixer, mut registry, mut writer) = ready_mixer(OutputType::Stereo, 2, device(2, false));
        let input: Vec<f32> = (0..96).map(|i| (i as f32 / 100.0) - 0.5).collect();
        write_frames(&mut writer, &input);

        let mut out = vec![0.0f32; 96];
        let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 48);
        assert_eq!(status, RenderStatus::Rendered);
        assert_eq!(out, input);
    }

    #[test]
    fn test_underrun_pads_with_silence() {
        let (mut mixer, mut registry, mut writer) = ready_mixer(OutputType::Stereo, 2, device(2, false));
        write_frames(&mut writer, &[0.25; 4]);

        let mut out = [1.0f32; 16];
        let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 8);
        assert_eq!(status, RenderStatus::Underrun);
        assert_eq!(&out[..4], &[0.25; 4]);
        assert_eq!(&out[4..], &[0.0; 12]);
    }

    #[test]
    fn test_empty_source_renders_full_silence() {
        let (mut mixer, mut registry, _writer) = ready_mixer(OutputType::Spatial, 6, device(2, false));

        let mut out = [1.0f32; 480 * 2];
        let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 480);
        assert_eq!(status, RenderStatus::Underrun);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_detached_source() {
        let (mut mixer, mut registry, _writer) = ready_mixer(OutputType::Stereo, 2, device(2, false));
        let handle = mixer.source().unwrap();
        registry.remove(handle);

        let mut out = [1.0f32; 8];
        let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 4);
        assert_eq!(status, RenderStatus::SourceDetached);
        assert_eq!(out, [0.0; 8]);
    }

    #[test]
    fn test_surround_renders_device_channel_count() {
        let (mut mixer, mut registry, mut writer) = ready_mixer(OutputType::Spatial, 6, device(2, false));
        write_frames(&mut writer, &[0.1; 6 * 240]);

        let mut out = vec![0.0f32; 240 * 2];
        let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 240);
        assert_eq!(status, RenderStatus::Rendered);
        assert_eq!(mixer.output_channels(), 2);
        assert!(out.iter().all(|s| *s > 0.0 && *s <= 1.0));
    }

    #[test]
    fn test_output_type_change_is_observable() {
        // Only the back-left channel carries signal
        let frame = [0.0, 0.0, 0.0, 0.0, 0.8, 0.0];

        let (mut mixer, mut registry, mut writer) = ready_mixer(OutputType::Stereo, 6, device(2, false));
        write_frames(&mut writer, &frame);
        let mut out = [0.0f32; 2];
        mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 1);
        assert!(out[0] > 0.0);
        assert_eq!(out[1], 0.0);

        mixer.set_output_type(OutputType::Spatial).unwrap();
        write_frames(&mut writer, &frame);
        mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 1);
        assert!(out[0] > out[1]);
        assert!(out[1] > 0.0);
    }

    #[test]
    fn test_set_output_type_rejected_while_rendering() {
        let (mut mixer, _registry, _writer) = ready_mixer(OutputType::Spatial, 6, device(2, false));
        mixer.begin_rendering().unwrap();

        assert!(matches!(
            mixer.set_output_type(OutputType::Stereo),
            Err(MixerError::InvalidState { state: MixerState::Rendering, .. })
        ));
        assert_eq!(mixer.output_type(), OutputType::Spatial);
    }

    #[test]
    fn test_head_tracking_follows_yaw() {
        // Center channel only
        let frame = [0.0, 0.0, 0.6, 0.0, 0.0, 0.0];
        let (mut mixer, mut registry, mut writer) = ready_mixer(OutputType::HeadTracked, 6, device(2, true));
        let head = mixer.head_orientation();

        write_frames(&mut writer, &frame);
        let mut out = [0.0f32; 2];
        mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 1);
        assert!((out[0] - out[1]).abs() < 1e-6);

        // Turning right moves the center source to the left ear
        head.set_yaw(std::f32::consts::FRAC_PI_2);
        write_frames(&mut writer, &frame);
        mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 1);
        assert!(out[0] > out[1]);
    }

    #[test]
    fn test_resampling_produces_requested_frames() {
        let mut mixer = SpatialMixer::new(device(2, false));
        mixer.configure(OutputType::Stereo, 24000, 48000, 2).unwrap();
        mixer
            .set_stream_format_and_layout(24000, ChannelLayout::Stereo, Scope::Input)
            .unwrap();
        let mut registry = SourceRegistry::new();
        let (mut writer, reader) = RingBuffer::with_capacity(4096);
        mixer.attach_source(registry.insert(reader)).unwrap();
        assert!(mixer.latency_seconds() > 0.006);

        write_frames(&mut writer, &[0.5; 2 * 120]);
        let mut out = vec![0.0f32; 2 * 200];
        let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 200);
        assert_eq!(status, RenderStatus::Rendered);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_resampled_stereo_keeps_hot_samples() {
        let mut mixer = SpatialMixer::new(device(2, false));
        mixer.configure(OutputType::Stereo, 24000, 48000, 2).unwrap();
        mixer
            .set_stream_format_and_layout(24000, ChannelLayout::Stereo, Scope::Input)
            .unwrap();
        let mut registry = SourceRegistry::new();
        let (mut writer, reader) = RingBuffer::with_capacity(4096);
        mixer.attach_source(registry.insert(reader)).unwrap();

        write_frames(&mut writer, &[1.5; 2 * 120]);
        let mut out = vec![0.0f32; 2 * 200];
        mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 200);
        assert!(out.iter().all(|s| (*s - 1.5).abs() < 1e-6));
    }

    #[test]
    fn test_folded_output_is_clamped() {
        let (mut mixer, mut registry, mut writer) = ready_mixer(OutputType::Stereo, 6, device(2, false));
        assert!(!mixer.passthrough);

        write_frames(&mut writer, &[4.0; 6 * 16]);
        let mut out = vec![0.0f32; 2 * 16];
        mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 16);
        assert!(out.iter().all(|s| (*s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_downmix_gains_do_not_clip() {
        let gains = build_gains(OutputType::Stereo, ChannelLayout::Surround71, ChannelLayout::Stereo, 0.0);
        for row in gains.iter().take(2) {
            assert!(row.iter().sum::<f32>() <= 1.0 + 1e-6);
        }
        // LFE is dropped from the plain fold-down
        assert_eq!(gains[0][3], 0.0);
        assert_eq!(gains[1][3], 0.0);
    }

    #[test]
    fn test_multichannel_output_maps_matching_speakers() {
        let gains = build_gains(OutputType::Spatial, ChannelLayout::Surround71, ChannelLayout::Surround51, 0.0);
        // Front left stays front left, side left folds to back left
        assert_eq!(gains[0][0], 1.0);
        assert_eq!(gains[4][6], 1.0);
        assert_eq!(gains[3][3], 1.0);
    }
}
