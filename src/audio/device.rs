//! Output device description and cpal device lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// How the output device is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportType {
    BuiltIn,
    Usb,
    Bluetooth,
    Hdmi,
    AirPlay,
    Virtual,
    Unknown,
}

impl TransportType {
    /// Best-effort guess from a device name, for hosts that do not expose transport
    pub fn from_device_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("airpods") || name.contains("bluetooth") || name.contains("bluez") {
            TransportType::Bluetooth
        } else if name.contains("airplay") {
            TransportType::AirPlay
        } else if name.contains("hdmi") || name.contains("displayport") {
            TransportType::Hdmi
        } else if name.contains("usb") {
            TransportType::Usb
        } else if name.contains("built-in") || name.contains("speakers") || name.contains("headphones") {
            TransportType::BuiltIn
        } else if name.contains("virtual") || name.contains("null") || name.contains("loopback") {
            TransportType::Virtual
        } else {
            TransportType::Unknown
        }
    }

    /// Four-character code in the style of platform transport tags
    pub fn tag(&self) -> &'static str {
        match self {
            TransportType::BuiltIn => "bltn",
            TransportType::Usb => "usb ",
            TransportType::Bluetooth => "blue",
            TransportType::Hdmi => "hdmi",
            TransportType::AirPlay => "airp",
            TransportType::Virtual => "virt",
            TransportType::Unknown => "????",
        }
    }
}

/// Identity and capabilities of the active output device.
///
/// Refreshed on the control thread after a route change; never touched by the
/// hardware callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub transport: TransportType,
    /// Data source tag (e.g. "hdpn", "ispk"), when the host reports one
    pub data_source: Option<String>,
    pub output_channels: u16,
    /// Every channel count the device accepts a stream in
    pub supported_channels: Vec<u16>,
    /// Nominal sample rate of the device
    pub sample_rate: u32,
    pub supported_sample_rates: Vec<u32>,
    /// Seconds
    pub hardware_latency: f64,
    /// Seconds, from the smallest supported buffer
    pub software_latency_min: f64,
    /// Seconds, from the largest supported buffer
    pub software_latency_max: f64,
    pub supports_head_tracking: bool,
}

impl DeviceProfile {
    pub fn supports_sample_rate(&self, rate: u32) -> bool {
        self.sample_rate == rate || self.supported_sample_rates.contains(&rate)
    }

    /// Whether a stream can be opened with exactly `channels` channels
    pub fn supports_channel_count(&self, channels: u16) -> bool {
        self.output_channels == channels || self.supported_channels.contains(&channels)
    }

    /// Spatial rendering needs at least a stereo pair
    pub fn supports_spatial(&self) -> bool {
        self.output_channels >= 2
    }
}

/// Latency figures reported when the hardware connection is opened
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceLatency {
    pub hardware: f64,
    pub software: f64,
}

/// Listing entry for output devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all output devices of the default host
pub fn list_output_devices() -> Vec<OutputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device);
                devices.push(OutputDeviceInfo {
                    is_default: default_name.as_ref() == Some(&name),
                    name,
                    sample_rates,
                    channels,
                });
            }
        }
    }
    devices
}

fn get_device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut rates = Vec::new();
    let mut chans = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            for rate_val in [44100u32, 48000, 88200, 96000, 176400, 192000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !rates.contains(&rate_val)
                {
                    rates.push(rate_val);
                }
            }
            if !chans.contains(&config.channels()) {
                chans.push(config.channels());
            }
        }
    }

    rates.sort_unstable();
    chans.sort_unstable();
    (rates, chans)
}

/// Find an output device by name, or the default device when `name` is `None`
pub fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()));
    };

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Build a profile from what cpal exposes about a device
pub fn profile_cpal_device(device: &cpal::Device) -> Result<DeviceProfile, AudioError> {
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let default_config = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    let sample_rate = default_config.sample_rate().0;
    let (supported_sample_rates, supported_channels) = get_device_capabilities(device);

    let (software_latency_min, software_latency_max) = match default_config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => (
            *min as f64 / sample_rate as f64,
            *max as f64 / sample_rate as f64,
        ),
        cpal::SupportedBufferSize::Unknown => (0.0, 0.0),
    };

    Ok(DeviceProfile {
        transport: TransportType::from_device_name(&name),
        name,
        data_source: None,
        output_channels: default_config.channels(),
        supported_channels,
        sample_rate,
        supported_sample_rates,
        hardware_latency: 0.0,
        software_latency_min,
        software_latency_max,
        supports_head_tracking: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_name() {
        assert_eq!(TransportType::from_device_name("AirPods Pro"), TransportType::Bluetooth);
        assert_eq!(TransportType::from_device_name("HDMI 0 (LG TV)"), TransportType::Hdmi);
        assert_eq!(TransportType::from_device_name("MacBook Pro Speakers"), TransportType::BuiltIn);
        assert_eq!(TransportType::from_device_name("USB Audio CODEC"), TransportType::Usb);
        assert_eq!(TransportType::from_device_name("pipewire"), TransportType::Unknown);
    }

    #[test]
    fn test_profile_sample_rate_support() {
        let profile = DeviceProfile {
            name: "test".into(),
            transport: TransportType::Virtual,
            data_source: None,
            output_channels: 2,
            supported_channels: vec![2, 8],
            sample_rate: 44100,
            supported_sample_rates: vec![44100, 48000],
            hardware_latency: 0.0,
            software_latency_min: 0.0,
            software_latency_max: 0.0,
            supports_head_tracking: false,
        };
        assert!(profile.supports_sample_rate(48000));
        assert!(!profile.supports_sample_rate(96000));
        assert!(profile.supports_spatial());
        assert!(profile.supports_channel_count(8));
        assert!(!profile.supports_channel_count(6));
    }
}
