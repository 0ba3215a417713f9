//! Session statistics
//!
//! `AudioStats` is shared by the decode thread, the hardware callback and
//! whoever displays it, so every counter is an atomic. `VideoStats` is only
//! touched off the real-time path and lives behind a `parking_lot` mutex.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters for the audio half of a session; reset only at session start
pub struct AudioStats {
    opus_bytes_received: AtomicU64,
    decoded_samples: AtomicU64,
    dropped_samples: AtomicU64,
    decode_duration_us: AtomicU64,
    last_rtt_ms: AtomicU32,
    packets_submitted: AtomicU64,
    packets_dropped: AtomicU64,
    frames_rendered: AtomicU64,
    underruns: AtomicU64,
    started: RwLock<(Instant, DateTime<Utc>)>,
}

impl Default for AudioStats {
    fn default() -> Self {
        Self {
            opus_bytes_received: AtomicU64::new(0),
            decoded_samples: AtomicU64::new(0),
            dropped_samples: AtomicU64::new(0),
            decode_duration_us: AtomicU64::new(0),
            last_rtt_ms: AtomicU32::new(0),
            packets_submitted: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            started: RwLock::new((Instant::now(), Utc::now())),
        }
    }
}

impl AudioStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session
    pub fn reset(&self) {
        for counter in [
            &self.opus_bytes_received,
            &self.decoded_samples,
            &self.dropped_samples,
            &self.decode_duration_us,
            &self.packets_submitted,
            &self.packets_dropped,
            &self.frames_rendered,
            &self.underruns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_rtt_ms.store(0, Ordering::Relaxed);
        *self.started.write() = (Instant::now(), Utc::now());
    }

    pub fn record_packet_received(&self, opus_bytes: usize) {
        self.opus_bytes_received
            .fetch_add(opus_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, samples: usize, elapsed: Duration) {
        self.decoded_samples.fetch_add(samples as u64, Ordering::Relaxed);
        self.decode_duration_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, samples: usize) {
        self.dropped_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn set_last_rtt(&self, rtt_ms: u32) {
        self.last_rtt_ms.store(rtt_ms, Ordering::Relaxed);
    }

    pub(crate) fn record_submit(&self, accepted: bool) {
        if accepted {
            self.packets_submitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Called from the hardware callback; atomics only
    pub(crate) fn record_render(&self, frames: usize, underrun: bool) {
        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
        if underrun {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> AudioStatsSnapshot {
        let (started_at, start_time) = *self.started.read();
        let elapsed = started_at.elapsed().as_secs_f64();
        let opus_bytes_received = self.opus_bytes_received.load(Ordering::Relaxed);

        AudioStatsSnapshot {
            opus_bytes_received,
            opus_kbits_per_sec: if elapsed > 0.0 {
                opus_bytes_received as f64 * 8.0 / 1000.0 / elapsed
            } else {
                0.0
            },
            decoded_samples: self.decoded_samples.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            decode_duration_us: self.decode_duration_us.load(Ordering::Relaxed),
            last_rtt_ms: self.last_rtt_ms.load(Ordering::Relaxed),
            packets_submitted: self.packets_submitted.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            start_time,
        }
    }
}

/// Point-in-time copy of [`AudioStats`]
#[derive(Debug, Clone, Serialize)]
pub struct AudioStatsSnapshot {
    pub opus_bytes_received: u64,
    /// Bitrate since session start, excluding FEC overhead
    pub opus_kbits_per_sec: f64,
    pub decoded_samples: u64,
    pub dropped_samples: u64,
    pub decode_duration_us: u64,
    pub last_rtt_ms: u32,
    pub packets_submitted: u64,
    pub packets_dropped: u64,
    pub frames_rendered: u64,
    pub underruns: u64,
    pub start_time: DateTime<Utc>,
}

/// Video counters kept by the video decode collaborator
#[derive(Debug, Clone, Serialize)]
pub struct VideoStats {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_frames: u32,
    pub received_frames: u32,
    pub network_dropped_frames: u32,
    pub total_host_processing_latency: u32,
    pub frames_with_host_processing_latency: u32,
    pub max_host_processing_latency: u32,
    pub min_host_processing_latency: u32,
    /// Seconds spent in the local decoder
    pub decode_time: f64,
}

impl Default for VideoStats {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            total_frames: 0,
            received_frames: 0,
            network_dropped_frames: 0,
            total_host_processing_latency: 0,
            frames_with_host_processing_latency: 0,
            max_host_processing_latency: 0,
            min_host_processing_latency: 0,
            decode_time: 0.0,
        }
    }
}

impl VideoStats {
    pub fn record_frame(&mut self, received: bool, host_latency: Option<u32>) {
        self.total_frames += 1;
        if received {
            self.received_frames += 1;
        } else {
            self.network_dropped_frames += 1;
        }

        if let Some(latency) = host_latency {
            if self.frames_with_host_processing_latency == 0 {
                self.min_host_processing_latency = latency;
            } else {
                self.min_host_processing_latency = self.min_host_processing_latency.min(latency);
            }
            self.max_host_processing_latency = self.max_host_processing_latency.max(latency);
            self.total_host_processing_latency += latency;
            self.frames_with_host_processing_latency += 1;
        }
    }

    pub fn received_fps(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let secs = (end - self.start_time).num_milliseconds() as f64 / 1000.0;
        if secs > 0.0 {
            self.received_frames as f64 / secs
        } else {
            0.0
        }
    }

    pub fn network_drop_rate(&self) -> f32 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.network_dropped_frames as f32 / self.total_frames as f32
        }
    }

    pub fn average_host_processing_latency(&self) -> Option<f64> {
        if self.frames_with_host_processing_latency == 0 {
            None
        } else {
            Some(self.total_host_processing_latency as f64 / self.frames_with_host_processing_latency as f64)
        }
    }
}

/// Video stats shared between the decoder and the UI
pub type SharedVideoStats = Arc<Mutex<VideoStats>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_counters_and_reset() {
        let stats = AudioStats::new();
        stats.record_packet_received(120);
        stats.record_decoded(960, Duration::from_micros(250));
        stats.record_dropped(480);
        stats.record_submit(true);
        stats.record_submit(false);
        stats.record_render(480, true);
        stats.set_last_rtt(12);

        let snap = stats.snapshot();
        assert_eq!(snap.opus_bytes_received, 120);
        assert_eq!(snap.decoded_samples, 960);
        assert_eq!(snap.dropped_samples, 480);
        assert_eq!(snap.decode_duration_us, 250);
        assert_eq!(snap.packets_submitted, 1);
        assert_eq!(snap.packets_dropped, 1);
        assert_eq!(snap.frames_rendered, 480);
        assert_eq!(snap.underruns, 1);
        assert_eq!(snap.last_rtt_ms, 12);

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.opus_bytes_received, 0);
        assert_eq!(snap.underruns, 0);
        assert_eq!(snap.last_rtt_ms, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = AudioStats::new();
        stats.record_packet_received(64);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["opus_bytes_received"], 64);
        assert!(json["start_time"].is_string());
    }

    #[test]
    fn test_video_stats() {
        let mut stats = VideoStats::default();
        stats.record_frame(true, Some(8));
        stats.record_frame(true, Some(4));
        stats.record_frame(false, None);

        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.network_dropped_frames, 1);
        assert_eq!(stats.min_host_processing_latency, 4);
        assert_eq!(stats.max_host_processing_latency, 8);
        assert_eq!(stats.average_host_processing_latency(), Some(6.0));
        assert!((stats.network_drop_rate() - 1.0 / 3.0).abs() < 1e-6);
    }
}
