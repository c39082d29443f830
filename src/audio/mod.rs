//! Audio primitives: the ring buffer bridge, format adaptation, the
//! processing callback contract and desktop device listing

pub mod buffer;
pub mod device;
pub mod format;
pub mod processor;

pub use buffer::{bridge, BridgeConsumer, BridgeProducer, RingBuffer};
pub use device::{list_devices, AudioDeviceInfo};
pub use format::{FormatAdapter, LinearResampler, StreamFormat};
pub use processor::{AudioProcessor, SampleBuffer};
