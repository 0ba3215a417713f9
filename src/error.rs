//! Error types for the audio output core

use thiserror::Error;

use crate::audio::mixer::{MixerState, OutputType};

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Mixer error: {0}")]
    Mixer(#[from] MixerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output engine and device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid audio configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine is not prepared for playback")]
    NotPrepared,

    #[error("Operation '{0}' is not valid in the current engine state")]
    InvalidState(&'static str),

    #[error("Hardware output initialization failed: {0}")]
    HardwareInit(String),

    #[error("Output backend did not release the render callback")]
    CallbackNotReleased,

    #[error("Spatial mixer error: {0}")]
    Mixer(#[from] MixerError),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Spatial mixing stage errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MixerError {
    #[error("Output type {0:?} is not supported by the current device")]
    UnsupportedOutputType(OutputType),

    #[error("Cannot {operation} while mixer is {state:?}")]
    InvalidState {
        state: MixerState,
        operation: &'static str,
    },

    #[error("Channel layout with {layout} channels does not match {expected} configured channels")]
    LayoutMismatch { layout: u16, expected: u16 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("Output buffer too small: need {needed} samples, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
