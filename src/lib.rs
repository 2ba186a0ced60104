//! # P2P Voice Call
//!
//! Low-latency duplex voice calls between two peers over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                        AUDIO DEVICE THREAD (cpal)                      │
//! │                                                                        │
//! │   ┌────────────┐   reference   ┌──────────────┐   ┌────────────────┐  │
//! │   │  Jitter    │──────────────▶│    Echo      │──▶│  Gate / Gain   │  │
//! │   │  Buffer    │──┐            │  Canceller   │   │  (+ RMS meter) │  │
//! │   └─────▲──────┘  │            └──────▲───────┘   └───────┬────────┘  │
//! │         │         ▼ speaker           │ microphone        │            │
//! │         │    ┌─────────┐         ┌─────────┐              ▼            │
//! │         │    │ Output  │         │  Input  │      ┌──────────────┐    │
//! │         │    └─────────┘         └─────────┘      │ Sample Ring  │    │
//! │         │                                         │   Buffer     │    │
//! └─────────┼─────────────────────────────────────────┴──────┬───────┴────┘
//!           │                                                │
//! ┌─────────┴──────────────┐                      ┌──────────▼─────────────┐
//! │  Receiver thread       │                      │  Sender thread         │
//! │  recv → validate → put │                      │  read → packet → send  │
//! └─────────▲──────────────┘                      └──────────┬─────────────┘
//!           │            UDP  [Seq (BE u32) | PCM i16 × N]   │
//!           └──────────────────────── peer ◀─────────────────┘
//! ```
//!
//! A [`session::CallController`] owns at most one [`session::CallSession`],
//! which wires the buffers, the echo canceller, the device stream and the
//! two network loops together for the lifetime of one call.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

    /// Mono voice
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Samples per device tick (and per packet), 10 ms
    pub const DEFAULT_FRAMES_PER_BUFFER: usize = 480;

    /// Outbound sample ring size in milliseconds
    pub const DEFAULT_RING_BUFFER_MS: u32 = 300;

    /// Number of jitter buffer slots
    pub const DEFAULT_JITTER_SLOTS: usize = 20;

    /// Distinct packets required before playout starts
    pub const DEFAULT_MIN_PLAYOUT_DELAY: usize = 4;

    /// Default microphone gain factor
    pub const DEFAULT_GAIN: f32 = 1.2;

    /// Default noise gate RMS threshold
    pub const DEFAULT_NOISE_GATE_THRESHOLD: f32 = 150.0;

    /// Allowed gain range
    pub const GAIN_RANGE: (f32, f32) = (1.0, 5.0);

    /// Allowed noise gate range
    pub const NOISE_GATE_RANGE: (f32, f32) = (0.0, 1000.0);

    /// RMS value shown as a full mic level meter
    pub const MIC_LEVEL_FULL_SCALE: f32 = 3000.0;

    /// Default local UDP port
    pub const DEFAULT_LOCAL_PORT: u16 = 5000;

    /// Default peer UDP port
    pub const DEFAULT_PEER_PORT: u16 = 6000;

    /// Width of one PCM sample on the wire
    pub const SAMPLE_BYTES: usize = std::mem::size_of::<i16>();
}
