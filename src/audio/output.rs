//! Hardware output connection
//!
//! The engine hands the backend a boxed render closure. The backend owns it for
//! as long as the stream runs and must drop it inside [`OutputBackend::stop`],
//! after the last callback has returned. Dropping the closure is what returns
//! the render context to the engine.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{find_output_device, profile_cpal_device, DeviceLatency, DeviceProfile};
use crate::audio::format::OutputFormat;
use crate::audio::route::{RouteChange, RouteChangeNotifier, RouteChangeReason};
use crate::error::AudioError;

/// Outcome of one render pass, returned from the real-time path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// The whole buffer was filled from the stream
    Rendered,
    /// The stream ran dry; the tail of the buffer is silence
    Underrun,
    /// No format or layout yet; the buffer is silence
    NotReady,
    /// The attached ring buffer is gone; the buffer is silence
    SourceDetached,
}

/// Position of a render pass on the output timeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderTimestamp {
    /// Output frames rendered before this pass
    pub sample_time: u64,
}

/// Real-time render callback: fill an interleaved output buffer
pub type RenderFn = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Platform audio output facility
pub trait OutputBackend: Send {
    /// Describe the device output would currently go to
    fn query_device(&mut self) -> Result<DeviceProfile, AudioError>;

    /// Validate `format` against the device and report its latency
    fn open(&mut self, format: &OutputFormat) -> Result<DeviceLatency, AudioError>;

    /// Begin invoking `callback` from the real-time context
    fn start(&mut self, format: OutputFormat, callback: RenderFn) -> Result<(), AudioError>;

    /// Stop callbacks and drop the render closure.
    ///
    /// Must not return while a callback is still executing.
    fn stop(&mut self) -> Result<(), AudioError>;

    /// Receive a handle for reporting device loss detected by the backend
    fn set_route_change_notifier(&mut self, _notifier: RouteChangeNotifier) {}
}

/// Largest callback buffer converted without reallocating, in samples
const CONVERT_SCRATCH_SAMPLES: usize = 8192 * 8;

/// cpal-backed output.
///
/// cpal streams are not `Send` on every host, so the stream lives on a
/// dedicated thread that keeps it alive while running and drops it on stop.
///
/// The engine renders `f32`. Devices without an `f32` configuration are driven
/// in `i32` or `i16`, converting each callback buffer.
pub struct CpalBackend {
    device_name: Option<String>,
    sample_format: cpal::SampleFormat,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    notifier: Option<RouteChangeNotifier>,
}

impl CpalBackend {
    /// Output to the named device, or the host default when `None`
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            sample_format: cpal::SampleFormat::F32,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            notifier: None,
        }
    }
}

impl OutputBackend for CpalBackend {
    fn query_device(&mut self) -> Result<DeviceProfile, AudioError> {
        let device = find_output_device(self.device_name.as_deref())?;
        profile_cpal_device(&device)
    }

    fn open(&mut self, format: &OutputFormat) -> Result<DeviceLatency, AudioError> {
        let device = find_output_device(self.device_name.as_deref())?;
        let formats: Vec<cpal::SampleFormat> = device
            .supported_output_configs()
            .map_err(|e| AudioError::CpalError(e.to_string()))?
            .filter(|range| {
                range.channels() == format.channels
                    && range.min_sample_rate().0 <= format.sample_rate
                    && range.max_sample_rate().0 >= format.sample_rate
            })
            .map(|range| range.sample_format())
            .collect();

        let Some(sample_format) = preferred_sample_format(&formats) else {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz x {} ch on {} (formats: {:?})",
                format.sample_rate,
                format.channels,
                device.name().unwrap_or_default(),
                formats
            )));
        };
        if sample_format != cpal::SampleFormat::F32 {
            tracing::info!("Device has no f32 output, converting to {:?}", sample_format);
        }
        self.sample_format = sample_format;

        let profile = profile_cpal_device(&device)?;
        Ok(DeviceLatency {
            hardware: profile.hardware_latency,
            software: profile.software_latency_min,
        })
    }

    fn start(&mut self, format: OutputFormat, mut callback: RenderFn) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::InvalidState("start"));
        }

        let device = find_output_device(self.device_name.as_deref())?;
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let notifier = self.notifier.clone();
        let sample_format = self.sample_format;

        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let on_error = move |err: cpal::StreamError| {
                    tracing::error!("Output stream error: {}", err);
                    if let (cpal::StreamError::DeviceNotAvailable, Some(notifier)) = (&err, &notifier) {
                        notifier.notify(RouteChange::new(RouteChangeReason::OldDeviceUnavailable));
                    }
                };

                let stream = match sample_format {
                    cpal::SampleFormat::I32 => {
                        build_converting_stream(&device, &config, callback, f32_to_i32, on_error)
                    }
                    cpal::SampleFormat::I16 => {
                        build_converting_stream(&device, &config, callback, f32_to_i16, on_error)
                    }
                    _ => device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback(data),
                        on_error,
                        None,
                    ),
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::HardwareInit(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::HardwareInit(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Dropping the stream joins the host callback and releases the closure
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let started = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| Err(AudioError::HardwareInit("output thread did not report".into())));

        match started {
            Ok(()) => {
                self.thread_handle = Some(handle);
                tracing::debug!("cpal output started: {} Hz x {} ch", format.sample_rate, format.channels);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| AudioError::StreamError("output thread panicked".into()))?;
        }
        Ok(())
    }

    fn set_route_change_notifier(&mut self, notifier: RouteChangeNotifier) {
        self.notifier = Some(notifier);
    }
}

/// Pick the output sample format, `f32` first
fn preferred_sample_format(available: &[cpal::SampleFormat]) -> Option<cpal::SampleFormat> {
    [cpal::SampleFormat::F32, cpal::SampleFormat::I32, cpal::SampleFormat::I16]
        .into_iter()
        .find(|f| available.contains(f))
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn f32_to_i32(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32
}

/// Render into an `f32` scratch buffer and convert into the device format
fn build_converting_stream<T, E>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut callback: RenderFn,
    convert: fn(f32) -> T,
    on_error: E,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + 'static,
    E: FnMut(cpal::StreamError) + Send + 'static,
{
    let mut scratch = vec![0.0f32; CONVERT_SCRATCH_SAMPLES];
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if scratch.len() < data.len() {
                // Only if the host hands over an unusually large buffer
                scratch.resize(data.len(), 0.0);
            }
            let rendered = &mut scratch[..data.len()];
            callback(rendered);
            for (out, &sample) in data.iter_mut().zip(rendered.iter()) {
                *out = convert(sample);
            }
        },
        on_error,
        None,
    )
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_f32_output() {
        use cpal::SampleFormat::*;
        assert_eq!(preferred_sample_format(&[I16, F32, I32]), Some(F32));
        assert_eq!(preferred_sample_format(&[I16, I32]), Some(I32));
        assert_eq!(preferred_sample_format(&[I16]), Some(I16));
        assert_eq!(preferred_sample_format(&[U8]), None);
    }

    #[test]
    fn test_integer_conversion_clamps() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i32(1.5), i32::MAX);
        assert!((f32_to_i32(0.5) as f64 - i32::MAX as f64 / 2.0).abs() < 2.0);
    }
}
