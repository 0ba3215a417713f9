//! Renderer facade used by the decode pipeline

use std::sync::Arc;

use crate::audio::engine::AudioOutputEngine;
use crate::audio::format::StreamFormat;
use crate::audio::output::OutputBackend;
use crate::audio::route::{RouteChange, RouteChangeNotifier};
use crate::codec::OpusMultistreamConfig;
use crate::config::AudioConfig;
use crate::error::{AudioError, Result};
use crate::stats::AudioStats;

/// Decouples the session layer from the engine's internals
pub struct AudioRenderer {
    engine: AudioOutputEngine,
}

impl AudioRenderer {
    /// Prepare an engine for the negotiated stream and connect it to the hardware
    pub fn new(
        opus_config: &OpusMultistreamConfig,
        config: AudioConfig,
        backend: Box<dyn OutputBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let format = StreamFormat::try_from(opus_config)?;

        let mut engine = AudioOutputEngine::new(config, backend);
        engine.prepare_for_playback(format)?;
        engine.init_hardware_connection()?;

        Ok(Self { engine })
    }

    /// Wrap an engine the caller has already set up
    pub fn from_engine(engine: AudioOutputEngine) -> Self {
        Self { engine }
    }

    pub fn start(&mut self) -> std::result::Result<(), AudioError> {
        self.engine.start()
    }

    pub fn stop(&mut self) -> std::result::Result<(), AudioError> {
        self.engine.stop()
    }

    /// Region the decoder writes one packet of interleaved samples into
    pub fn get_audio_buffer(&mut self) -> Option<&mut [f32]> {
        self.engine.get_write_buffer()
    }

    /// Returns false if the packet was dropped for lack of buffer space
    pub fn submit_audio(&mut self, samples_written: usize) -> bool {
        self.engine.submit_audio(samples_written)
    }

    pub fn handle_route_change(&self, change: RouteChange) {
        self.engine.handle_route_change(change);
    }

    pub fn route_change_notifier(&self) -> RouteChangeNotifier {
        self.engine.route_change_notifier()
    }

    /// Latency figure for A/V sync
    pub fn latency_seconds(&self) -> f64 {
        self.engine.latency_seconds()
    }

    pub fn stats(&self) -> Arc<AudioStats> {
        self.engine.stats()
    }

    pub fn engine(&self) -> &AudioOutputEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut AudioOutputEngine {
        &mut self.engine
    }
}
