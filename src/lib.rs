//! # Game-Stream Audio Core
//!
//! Real-time audio output for a game-streaming client: decoded Opus packets
//! go in on the decode thread, the hardware pulls mixed frames out on its
//! own real-time callback.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         DECODE THREAD                                │
//! │  ┌─────────────┐    ┌──────────────┐    ┌─────────────────────────┐  │
//! │  │ Opus packet │───▶│ OpusDecoder  │───▶│ AudioRenderer           │  │
//! │  └─────────────┘    └──────────────┘    │  get_audio_buffer()     │  │
//! │                                         │  submit_audio(samples)  │  │
//! │                                         └────────────┬────────────┘  │
//! └──────────────────────────────────────────────────────┼───────────────┘
//!                                                        │ RingWriter
//!                                                        ▼
//!                                   ┌─────────────────────────────────┐
//!                                   │ RingBuffer (lock-free SPSC)     │
//!                                   └────────────────┬────────────────┘
//!                                                    │ RingReader
//! ┌──────────────────────────────────────────────────┼───────────────────┐
//! │                    HARDWARE CALLBACK              ▼                   │
//! │   ┌───────────────────────┐          ┌───────────────────────────┐   │
//! │   │ render_direct         │    or    │ render_spatial            │   │
//! │   │ copy ring ─▶ device   │          │ SpatialMixer: remap, SRC, │   │
//! │   └───────────┬───────────┘          │ virtualize, head tracking │   │
//! │               │                      └─────────────┬─────────────┘   │
//! │               └──────────────┬─────────────────────┘                 │
//! │                              ▼                                       │
//! │                    OutputBackend (cpal)                              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control operations (prepare, start, stop, route changes, output type
//! changes) happen on a control thread and never contend with the callback.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod stats;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate negotiated by default
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Samples per channel in one 5 ms packet at 48 kHz
    pub const DEFAULT_SAMPLES_PER_FRAME: u32 = 240;

    /// Largest channel count the mixer handles (7.1)
    pub const MAX_CHANNELS: usize = 8;

    /// Packets worth of slack in the output ring buffer
    pub const DEFAULT_RING_BUFFER_PACKETS: usize = 8;
}
