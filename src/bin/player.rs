//! Audio Player
//!
//! Drives the output engine without a streaming host: encodes a test tone
//! with Opus and feeds it through the decoder and renderer on this thread,
//! the same way a session's decode thread would.

use anyhow::{bail, Context, Result};
use opus::{Application, Channels, Encoder};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gamestream_audio::{
    audio::{list_output_devices, AudioRenderer, CpalBackend},
    codec::{OpusDecoder, OpusMultistreamConfig},
    config::AudioConfig,
    constants::DEFAULT_CHANNELS,
};

struct Args {
    list: bool,
    device: Option<String>,
    seconds: u64,
    surround: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        list: false,
        device: None,
        seconds: 5,
        surround: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--list" => args.list = true,
            "--surround" => args.surround = true,
            "--device" => args.device = Some(iter.next().context("--device needs a name")?),
            "--seconds" => {
                args.seconds = iter
                    .next()
                    .context("--seconds needs a value")?
                    .parse()
                    .context("--seconds must be a whole number")?
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;

    if args.list {
        println!("\n=== Available Output Devices ===");
        for device in list_output_devices() {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}:", device.name, default_marker);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
        println!();
        return Ok(());
    }

    let mut config = AudioConfig::load_or_default()?;
    if args.device.is_some() {
        config.preferred_device = args.device.clone();
    }

    let opus_config = if args.surround {
        OpusMultistreamConfig::surround51()
    } else {
        OpusMultistreamConfig::stereo()
    };
    let backend = CpalBackend::new(config.preferred_device.clone());
    let mut renderer = AudioRenderer::new(&opus_config, config, Box::new(backend))?;

    tracing::info!(
        "Playing {} ch test tone for {} s, output latency {:.1} ms",
        opus_config.channel_count,
        args.seconds,
        renderer.latency_seconds() * 1000.0
    );
    renderer.start()?;

    let result = if args.surround {
        play_pcm(&mut renderer, &opus_config, args.seconds)
    } else {
        play_opus(&mut renderer, &opus_config, args.seconds)
    };

    renderer.stop()?;
    let snapshot = serde_json::to_string_pretty(&renderer.stats().snapshot())?;
    tracing::info!("Final audio stats:\n{}", snapshot);
    result
}

/// Per-channel test tone, each channel a different pitch
fn tone(frame_index: u64, channel: usize, sample_rate: u32) -> f32 {
    let t = frame_index as f32 / sample_rate as f32;
    let freq = 330.0 + 110.0 * channel as f32;
    (t * freq * 2.0 * std::f32::consts::PI).sin() * 0.2
}

/// Encode the tone and push it through the Opus decode path
fn play_opus(renderer: &mut AudioRenderer, opus_config: &OpusMultistreamConfig, seconds: u64) -> Result<()> {
    let frames = opus_config.samples_per_frame as usize;
    let channels = DEFAULT_CHANNELS as usize;
    let mut encoder = Encoder::new(opus_config.sample_rate, Channels::Stereo, Application::LowDelay)
        .context("Failed to create Opus encoder")?;
    let mut decoder = OpusDecoder::new(opus_config)?;
    let stats = renderer.stats();

    let mut pcm = vec![0.0f32; frames * channels];
    let mut packet = vec![0u8; 4000];
    let mut frame_index = 0u64;

    pace(renderer, opus_config, seconds, |renderer| {
        for (i, frame) in pcm.chunks_exact_mut(channels).enumerate() {
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = tone(frame_index + i as u64, ch, opus_config.sample_rate);
            }
        }
        frame_index += frames as u64;

        let len = encoder.encode_float(&pcm, &mut packet).context("Opus encode failed")?;
        if !decoder.decode_to_renderer(Some(&packet[..len]), renderer, &stats)? {
            tracing::debug!("Packet dropped");
        }
        Ok(())
    })
}

/// Write the tone straight into the renderer, for layouts the decoder lacks
fn play_pcm(renderer: &mut AudioRenderer, opus_config: &OpusMultistreamConfig, seconds: u64) -> Result<()> {
    let frames = opus_config.samples_per_frame as usize;
    let channels = opus_config.channel_count as usize;
    let mut frame_index = 0u64;

    pace(renderer, opus_config, seconds, |renderer| {
        let Some(buffer) = renderer.get_audio_buffer() else {
            bail!("Renderer is not prepared");
        };
        for (i, frame) in buffer.chunks_exact_mut(channels).enumerate() {
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = tone(frame_index + i as u64, ch, opus_config.sample_rate);
            }
        }
        frame_index += frames as u64;
        renderer.submit_audio(frames * channels);
        Ok(())
    })
}

/// Produce one packet per packet interval, handling route changes and
/// logging stats once a second
fn pace<F>(renderer: &mut AudioRenderer, opus_config: &OpusMultistreamConfig, seconds: u64, mut produce: F) -> Result<()>
where
    F: FnMut(&mut AudioRenderer) -> Result<()>,
{
    let packet_interval =
        Duration::from_secs_f64(opus_config.samples_per_frame as f64 / opus_config.sample_rate as f64);
    let started = Instant::now();
    let deadline = started + Duration::from_secs(seconds);
    let mut next_packet = started;
    let mut last_stats_time = started;

    while Instant::now() < deadline {
        if renderer.engine_mut().reinitialize_if_needed()? {
            tracing::info!(
                "Output moved to {}",
                renderer
                    .engine()
                    .device()
                    .map(|d| d.name.as_str())
                    .unwrap_or("unknown device")
            );
        }

        produce(renderer)?;
        next_packet += packet_interval;

        if last_stats_time.elapsed() >= Duration::from_secs(1) {
            last_stats_time = Instant::now();
            let snapshot = renderer.stats().snapshot();
            let fill = renderer.engine().buffer_fill();
            tracing::info!(
                "Audio stats: {} submitted, {} dropped, {} underruns, buffer {}/{} bytes",
                snapshot.packets_submitted,
                snapshot.packets_dropped,
                snapshot.underruns,
                fill.map(|f| f.filled_bytes).unwrap_or(0),
                fill.map(|f| f.capacity_bytes).unwrap_or(0)
            );
        }

        let now = Instant::now();
        if next_packet > now {
            std::thread::sleep(next_packet - now);
        }
    }
    Ok(())
}
