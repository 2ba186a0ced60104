//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod duplex;
pub mod echo;
pub mod pipeline;

pub use buffer::{JitterBuffer, Playout, SampleRingBuffer};
pub use device::{list_devices, AudioBackend, DuplexStream, TickCallback};
pub use duplex::CpalBackend;
pub use echo::{create_echo_canceller, EchoCanceller};
pub use pipeline::AudioPipeline;
