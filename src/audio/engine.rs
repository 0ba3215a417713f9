//! Audio output engine
//!
//! Owns the ring buffer, the optional spatial mixing stage and the hardware
//! connection. The decode thread fills [`AudioOutputEngine::get_write_buffer`]
//! and pushes it with [`AudioOutputEngine::submit_audio`]; the hardware callback
//! drains the ring either directly or through the mixer.
//!
//! Everything the callback touches lives in a [`RenderContext`]. On `start` the
//! context moves into the render closure handed to the backend; on `stop` the
//! backend drops the closure after the last callback returns and the context
//! comes back. While rendering, the control thread has no path to the mixer at
//! all, so reconfiguration cannot race the callback.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;

use crate::audio::buffer::{bytes_to_samples, samples_as_bytes, RingBuffer, RingWriter};
use crate::audio::device::{DeviceLatency, DeviceProfile};
use crate::audio::format::{ChannelLayout, OutputFormat, Scope, StreamFormat, BYTES_PER_SAMPLE};
use crate::audio::mixer::{HeadOrientation, MixerState, OutputType, SpatialMixer};
use crate::audio::output::{OutputBackend, RenderFn, RenderStatus, RenderTimestamp};
use crate::audio::registry::{SourceHandle, SourceRegistry};
use crate::audio::route::{RouteChange, RouteChangeNotifier, RouteChangeQueue};
use crate::config::AudioConfig;
use crate::error::{AudioError, MixerError};
use crate::stats::AudioStats;

/// Which callback binding feeds the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPath {
    /// Ring bytes are copied straight to the output
    Direct,
    /// Frames go through the spatial mixing stage
    Spatial,
}

/// Ring buffer occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFill {
    pub capacity_bytes: usize,
    pub filled_bytes: usize,
}

/// State owned by whichever side is currently rendering
pub(crate) struct RenderContext {
    registry: SourceRegistry,
    source: SourceHandle,
    mixer: Option<SpatialMixer>,
    output_channels: usize,
    sample_time: u64,
    stats: Arc<AudioStats>,
}

type RenderBinding = fn(&mut RenderContext, &mut [f32], &RenderTimestamp) -> RenderStatus;

/// Direct binding: copy whole samples out of the ring, pad with silence
fn render_direct(ctx: &mut RenderContext, output: &mut [f32], _timestamp: &RenderTimestamp) -> RenderStatus {
    let Some(reader) = ctx.registry.get_mut(ctx.source) else {
        output.fill(0.0);
        return RenderStatus::SourceDetached;
    };

    let mut filled = 0;
    while filled < output.len() {
        let chunk = reader.read((output.len() - filled) * BYTES_PER_SAMPLE);
        if chunk.is_empty() {
            break;
        }
        let n = bytes_to_samples(chunk, &mut output[filled..]);
        reader.commit_read(n * BYTES_PER_SAMPLE);
        filled += n;
    }

    if filled < output.len() {
        output[filled..].fill(0.0);
        RenderStatus::Underrun
    } else {
        RenderStatus::Rendered
    }
}

/// Spatial binding: let the mixer pull and transform
fn render_spatial(ctx: &mut RenderContext, output: &mut [f32], timestamp: &RenderTimestamp) -> RenderStatus {
    let Some(mixer) = ctx.mixer.as_mut() else {
        output.fill(0.0);
        return RenderStatus::NotReady;
    };

    let frames = output.len() / ctx.output_channels;
    let status = mixer.render(&mut ctx.registry, output, timestamp, frames);
    output[frames * ctx.output_channels..].fill(0.0);
    status
}

/// Owns the render context while the backend holds the callback and sends it
/// back to the engine when the backend drops the closure
struct CallbackGuard {
    ctx: Option<Box<RenderContext>>,
    home: Sender<Box<RenderContext>>,
    binding: RenderBinding,
}

impl CallbackGuard {
    fn invoke(&mut self, output: &mut [f32]) {
        let Some(ctx) = self.ctx.as_mut() else {
            output.fill(0.0);
            return;
        };

        let timestamp = RenderTimestamp {
            sample_time: ctx.sample_time,
        };
        let status = (self.binding)(ctx, output, &timestamp);
        let frames = output.len() / ctx.output_channels;
        ctx.sample_time += frames as u64;
        ctx.stats.record_render(frames, status != RenderStatus::Rendered);
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let _ = self.home.send(ctx);
        }
    }
}

/// Real-time audio output engine
pub struct AudioOutputEngine {
    config: AudioConfig,
    backend: Box<dyn OutputBackend>,
    routes: RouteChangeQueue,
    stats: Arc<AudioStats>,

    device: Option<DeviceProfile>,
    format: Option<StreamFormat>,
    output_format: Option<OutputFormat>,
    path: RenderPath,
    output_type: OutputType,

    latency: DeviceLatency,
    stage_latency: f64,

    writer: Option<RingWriter>,
    write_buffer: Vec<f32>,
    staging: Vec<u8>,
    head: Option<HeadOrientation>,

    context: Option<Box<RenderContext>>,
    context_tx: Sender<Box<RenderContext>>,
    context_rx: Receiver<Box<RenderContext>>,

    connected: bool,
    running: bool,
    /// Output was running when a route rebuild failed; restart once it succeeds
    resume_pending: bool,
}

impl AudioOutputEngine {
    pub fn new(config: AudioConfig, mut backend: Box<dyn OutputBackend>) -> Self {
        let routes = RouteChangeQueue::new();
        backend.set_route_change_notifier(routes.notifier());
        let (context_tx, context_rx) = bounded(1);

        Self {
            output_type: config.spatial.output_type,
            config,
            backend,
            routes,
            stats: Arc::new(AudioStats::new()),
            device: None,
            format: None,
            output_format: None,
            path: RenderPath::Direct,
            latency: DeviceLatency::default(),
            stage_latency: 0.0,
            writer: None,
            write_buffer: Vec::new(),
            staging: Vec::new(),
            head: None,
            context: None,
            context_tx,
            context_rx,
            connected: false,
            running: false,
            resume_pending: false,
        }
    }

    /// Size buffers and pick the render path for a new session
    pub fn prepare_for_playback(&mut self, format: StreamFormat) -> Result<(), AudioError> {
        if self.running {
            return Err(AudioError::InvalidState("prepare_for_playback"));
        }
        self.config
            .validate()
            .map_err(|e| AudioError::InvalidConfig(e.to_string()))?;
        self.stats.reset();
        self.build(format)
    }

    fn build(&mut self, format: StreamFormat) -> Result<(), AudioError> {
        let ring_capacity = format
            .packet_bytes()
            .checked_mul(self.config.ring_buffer_packets)
            .filter(|&bytes| bytes > 0)
            .ok_or_else(|| {
                AudioError::InvalidConfig(format!(
                    "ring of {} packets of {} bytes",
                    self.config.ring_buffer_packets,
                    format.packet_bytes()
                ))
            })?;

        // A failed query leaves the previous session in place
        let device = self.backend.query_device()?;

        self.release_buffers();
        self.output_format = None;
        self.connected = false;
        tracing::info!(
            "Output device: {} ({}, {} ch @ {} Hz)",
            device.name,
            device.transport.tag(),
            device.output_channels,
            device.sample_rate
        );

        let rate_supported = device.supports_sample_rate(format.sample_rate);
        let output_rate = if rate_supported {
            format.sample_rate
        } else {
            device.sample_rate
        };
        let wants_spatial = self.config.spatial.enabled && format.channels > 2 && device.supports_spatial();
        let direct = !wants_spatial && rate_supported && device.supports_channel_count(format.channels);

        let (writer, reader) = RingBuffer::with_capacity(ring_capacity);
        let mut registry = SourceRegistry::new();
        let source = registry.insert(reader);

        let (path, output_format, mixer) = if direct {
            let output_format = OutputFormat {
                sample_rate: format.sample_rate,
                channels: format.channels,
            };
            (RenderPath::Direct, output_format, None)
        } else {
            let requested = if wants_spatial {
                self.output_type
            } else {
                OutputType::Stereo
            };
            let mut mixer = SpatialMixer::new(device.clone());
            let output_type = configure_best(&mut mixer, requested, format.sample_rate, output_rate, format.channels)?;
            mixer.set_stream_format_and_layout(format.sample_rate, format.layout(), Scope::Input)?;
            mixer.set_stream_format_and_layout(
                output_rate,
                ChannelLayout::from_channel_count(device.output_channels),
                Scope::Output,
            )?;
            mixer.set_personalized_hrtf(self.config.spatial.personalized_hrtf)?;
            mixer.attach_source(source)?;

            self.output_type = output_type;
            let output_format = OutputFormat {
                sample_rate: output_rate,
                channels: device.output_channels,
            };
            (RenderPath::Spatial, output_format, Some(mixer))
        };

        tracing::info!(
            "Prepared {:?} path: {} Hz x {} ch -> {} Hz x {} ch, ring {} bytes ({} packets of {:?})",
            path,
            format.sample_rate,
            format.channels,
            output_format.sample_rate,
            output_format.channels,
            writer.capacity(),
            self.config.ring_buffer_packets,
            format.packet_duration()
        );

        self.stage_latency = mixer.as_ref().map(SpatialMixer::latency_seconds).unwrap_or(0.0);
        self.head = mixer.as_ref().map(SpatialMixer::head_orientation);
        self.context = Some(Box::new(RenderContext {
            registry,
            source,
            mixer,
            output_channels: output_format.channels as usize,
            sample_time: 0,
            stats: self.stats.clone(),
        }));
        self.writer = Some(writer);
        self.write_buffer = vec![0.0; format.packet_samples()];
        self.staging = vec![0; format.packet_bytes()];
        self.device = Some(device);
        self.format = Some(format);
        self.output_format = Some(output_format);
        self.path = path;
        self.connected = false;
        Ok(())
    }

    /// Open the hardware output for the prepared format and read its latency
    pub fn init_hardware_connection(&mut self) -> Result<(), AudioError> {
        let output_format = self.output_format.ok_or(AudioError::NotPrepared)?;

        self.latency = self.backend.open(&output_format).map_err(|e| {
            tracing::error!("Failed to open hardware output: {}", e);
            e
        })?;
        self.connected = true;

        tracing::info!(
            "Hardware output ready ({:?} callback), latency hw {:.1} ms + sw {:.1} ms",
            self.path,
            self.latency.hardware * 1000.0,
            self.latency.software * 1000.0
        );
        Ok(())
    }

    /// Scratch region for one decoded packet; `None` until prepared
    pub fn get_write_buffer(&mut self) -> Option<&mut [f32]> {
        self.writer.as_ref()?;
        Some(&mut self.write_buffer[..])
    }

    /// Push `samples_written` interleaved samples from the write buffer.
    ///
    /// Returns false and drops the packet when the ring buffer lacks space.
    pub fn submit_audio(&mut self, samples_written: usize) -> bool {
        let (Some(writer), Some(format)) = (self.writer.as_mut(), self.format) else {
            return false;
        };

        let channels = format.channels as usize;
        let samples = samples_written.min(self.write_buffer.len());
        let samples = samples - samples % channels;
        let bytes = samples_as_bytes(&self.write_buffer[..samples], &mut self.staging);

        let accepted = writer.write(&self.staging[..bytes]);
        self.stats.record_submit(accepted);
        if !accepted {
            tracing::trace!("Ring buffer full, dropped {} samples", samples);
        }
        accepted
    }

    /// Start the hardware callback, applying any pending device change first
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running {
            return Ok(());
        }

        self.reinitialize_if_needed()?;
        if self.running {
            // The rebuild already resumed output
            return Ok(());
        }
        if !self.connected {
            self.init_hardware_connection()?;
        }

        let output_format = self.output_format.ok_or(AudioError::NotPrepared)?;
        let mut ctx = self.context.take().ok_or(AudioError::NotPrepared)?;
        if let Some(mixer) = ctx.mixer.as_mut() {
            if let Err(e) = mixer.begin_rendering() {
                self.context = Some(ctx);
                return Err(e.into());
            }
        }

        let binding: RenderBinding = match self.path {
            RenderPath::Direct => render_direct,
            RenderPath::Spatial => render_spatial,
        };
        let mut guard = CallbackGuard {
            ctx: Some(ctx),
            home: self.context_tx.clone(),
            binding,
        };
        let callback: RenderFn = Box::new(move |output: &mut [f32]| guard.invoke(output));

        if let Err(e) = self.backend.start(output_format, callback) {
            tracing::error!("Failed to start hardware output: {}", e);
            if let Err(recover) = self.recover_context() {
                tracing::error!("Render context lost after failed start: {}", recover);
            }
            return Err(e);
        }

        self.running = true;
        tracing::info!("Audio output started");
        Ok(())
    }

    /// Stop the hardware callback.
    ///
    /// Returns only after the backend has released the callback, so buffers
    /// can be freed right after.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.resume_pending = false;
        if !self.running {
            return Ok(());
        }

        let stopped = self.backend.stop();
        self.running = false;
        let recovered = self.recover_context();

        stopped?;
        recovered?;
        tracing::info!("Audio output stopped");
        Ok(())
    }

    fn recover_context(&mut self) -> Result<(), AudioError> {
        match self.context_rx.try_recv() {
            Ok(mut ctx) => {
                if let Some(mixer) = ctx.mixer.as_mut() {
                    mixer.end_rendering();
                }
                self.context = Some(ctx);
                Ok(())
            }
            Err(_) => {
                // Without the context nothing can render again; rebuild on next start
                self.routes.request_reinit();
                Err(AudioError::CallbackNotReleased)
            }
        }
    }

    /// Switch the spatial stage's output type; only while stopped
    pub fn set_output_type(&mut self, output_type: OutputType) -> Result<(), AudioError> {
        if self.running {
            return Err(MixerError::InvalidState {
                state: MixerState::Rendering,
                operation: "set output type",
            }
            .into());
        }

        let ctx = self.context.as_mut().ok_or(AudioError::NotPrepared)?;
        let Some(mixer) = ctx.mixer.as_mut() else {
            return Err(MixerError::InvalidState {
                state: MixerState::Uninitialized,
                operation: "set output type",
            }
            .into());
        };

        mixer.set_output_type(output_type)?;
        self.output_type = output_type;
        self.stage_latency = mixer.latency_seconds();
        Ok(())
    }

    /// Handle for delivering route changes from any thread
    pub fn route_change_notifier(&self) -> RouteChangeNotifier {
        self.routes.notifier()
    }

    /// Record a route change; the rebuild happens later on the control thread
    pub fn handle_route_change(&self, change: RouteChange) {
        self.routes.notifier().notify(change);
    }

    pub fn needs_reinit(&self) -> bool {
        self.routes.needs_reinit()
    }

    /// Rebuild against the current device if a route change asked for it.
    ///
    /// Control thread only. Returns whether a rebuild happened.
    pub fn reinitialize_if_needed(&mut self) -> Result<bool, AudioError> {
        let (requested, changes) = self.routes.take();
        for change in &changes {
            tracing::info!(
                "Route change: {:?}{}",
                change.reason,
                change
                    .device_name
                    .as_deref()
                    .map(|name| format!(" -> {}", name))
                    .unwrap_or_default()
            );
        }
        if !requested {
            return Ok(false);
        }

        tracing::info!("Reinitializing audio output after device change");
        if let Err(e) = self.rebuild_for_route() {
            // The route is probably still settling; retry at the next safe point
            tracing::warn!("Audio output reinit failed, will retry: {}", e);
            self.routes.request_reinit();
            return Err(e);
        }
        Ok(true)
    }

    fn rebuild_for_route(&mut self) -> Result<(), AudioError> {
        let resume = self.running || self.resume_pending;
        let was_connected = self.connected;
        let stopped = self.stop();
        self.resume_pending = resume;
        stopped?;

        match self.format {
            Some(format) => {
                self.build(format)?;
                if was_connected || resume {
                    self.init_hardware_connection()?;
                }
                if resume {
                    self.start()?;
                }
                self.resume_pending = false;
            }
            None => {
                self.device = Some(self.backend.query_device()?);
            }
        }
        Ok(())
    }

    /// Stop and free everything, mixer before ring buffer
    pub fn teardown(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Error stopping output during teardown: {}", e);
        }
        self.release_buffers();
        self.format = None;
        self.output_format = None;
        self.connected = false;
    }

    fn release_buffers(&mut self) {
        if let Some(mut ctx) = self.context.take() {
            ctx.mixer = None;
            ctx.registry.remove(ctx.source);
        }
        self.writer = None;
        self.head = None;
        self.write_buffer = Vec::new();
        self.staging = Vec::new();
    }

    /// Seconds from submit to speaker: hardware + software + mixing stage
    pub fn latency_seconds(&self) -> f64 {
        self.latency.hardware + self.latency.software + self.stage_latency
    }

    pub fn buffer_fill(&self) -> Option<BufferFill> {
        self.writer.as_ref().map(|w| BufferFill {
            capacity_bytes: w.capacity(),
            filled_bytes: w.capacity() - w.available_write(),
        })
    }

    /// Input sample rate of the prepared stream
    pub fn sample_rate(&self) -> Option<u32> {
        self.format.map(|f| f.sample_rate)
    }

    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }

    pub fn device(&self) -> Option<&DeviceProfile> {
        self.device.as_ref()
    }

    pub fn path(&self) -> RenderPath {
        self.path
    }

    pub fn is_spatial(&self) -> bool {
        self.output_format.is_some() && self.path == RenderPath::Spatial
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Listener orientation handle when a spatial stage is active
    pub fn head_orientation(&self) -> Option<HeadOrientation> {
        self.head.clone()
    }

    pub fn stats(&self) -> Arc<AudioStats> {
        self.stats.clone()
    }
}

impl Drop for AudioOutputEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Configure with the requested type, stepping down to what the device supports
fn configure_best(
    mixer: &mut SpatialMixer,
    requested: OutputType,
    input_rate: u32,
    output_rate: u32,
    channels: u16,
) -> Result<OutputType, AudioError> {
    let candidates: &[OutputType] = match requested {
        OutputType::HeadTracked => &[OutputType::HeadTracked, OutputType::Spatial, OutputType::Stereo],
        OutputType::Spatial => &[OutputType::Spatial, OutputType::Stereo],
        OutputType::Stereo => &[OutputType::Stereo],
    };

    for &candidate in candidates {
        match mixer.configure(candidate, input_rate, output_rate, channels) {
            Ok(()) => return Ok(candidate),
            Err(MixerError::UnsupportedOutputType(t)) => {
                tracing::warn!("Output type {:?} unsupported by device, falling back", t);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(MixerError::UnsupportedOutputType(requested).into())
}
