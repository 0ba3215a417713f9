//! Audio output subsystem

pub mod buffer;
pub mod device;
pub mod engine;
pub mod format;
pub mod mixer;
pub mod output;
pub mod registry;
pub mod renderer;
pub mod route;

pub use buffer::{RingBuffer, RingReader, RingWriter};
pub use device::{list_output_devices, DeviceLatency, DeviceProfile, OutputDeviceInfo, TransportType};
pub use engine::{AudioOutputEngine, BufferFill, RenderPath};
pub use format::{ChannelLayout, OutputFormat, Scope, Speaker, StreamFormat};
pub use mixer::{HeadOrientation, MixerState, OutputType, SpatialMixer, SpatialMixerConfig};
pub use output::{CpalBackend, OutputBackend, RenderFn, RenderStatus, RenderTimestamp};
pub use registry::{SourceHandle, SourceRegistry};
pub use renderer::AudioRenderer;
pub use route::{RouteChange, RouteChangeNotifier, RouteChangeReason};
