//! Acoustic echo cancellation
//!
//! The pipeline only needs the [`EchoCanceller`] contract: given the frame
//! just sent to the speaker and the frame just captured, produce a capture
//! frame of equal length with the speaker's echo suppressed.
//!
//! The real canceller is WebRTC's AEC3 (via the `aec3` crate), which works
//! on 10 ms blocks. Device ticks of any other length are re-framed through
//! preallocated queues, adding at most one block of latency.

use aec3::voip::VoipAec3;
use std::collections::VecDeque;

use crate::config::EchoConfig;
use crate::error::AudioError;

/// Sample rates AEC3 runs at natively
pub const AEC_SAMPLE_RATES: [u32; 3] = [16_000, 32_000, 48_000];

/// Echo suppression capability used once per device tick
pub trait EchoCanceller: Send {
    /// Remove the echo of `playback` from `capture`, writing into `out`.
    ///
    /// All three slices have the frame length.
    fn cancel(&mut self, playback: &[i16], capture: &[i16], out: &mut [i16]) -> Result<(), AudioError>;
}

/// Build the canceller described by `config`
pub fn create_echo_canceller(
    config: &EchoConfig,
    sample_rate: u32,
    frame_len: usize,
) -> Result<Box<dyn EchoCanceller>, AudioError> {
    if !config.enabled {
        tracing::info!("Echo cancellation disabled");
        return Ok(Box::new(PassthroughCanceller::new(frame_len)));
    }

    let canceller = Aec3Canceller::new(sample_rate, frame_len)?;
    tracing::info!(
        "Echo canceller ready: AEC3 at {} Hz, {}-sample blocks for {}-sample ticks",
        sample_rate,
        canceller.block_len(),
        frame_len
    );
    Ok(Box::new(canceller))
}

fn check_len(expected: usize, actual: usize) -> Result<(), AudioError> {
    if expected == actual {
        Ok(())
    } else {
        Err(AudioError::FrameSize { expected, actual })
    }
}

/// Copies the capture through unchanged
pub struct PassthroughCanceller {
    frame_len: usize,
}

impl PassthroughCanceller {
    pub fn new(frame_len: usize) -> Self {
        Self { frame_len }
    }
}

impl EchoCanceller for PassthroughCanceller {
    fn cancel(&mut self, playback: &[i16], capture: &[i16], out: &mut [i16]) -> Result<(), AudioError> {
        check_len(self.frame_len, playback.len())?;
        check_len(self.frame_len, capture.len())?;
        check_len(self.frame_len, out.len())?;
        out.copy_from_slice(capture);
        Ok(())
    }
}

/// Converts between device ticks and fixed-size processing blocks.
///
/// Every queue is allocated up front; steady-state use never grows them.
struct Reframer {
    frame_len: usize,
    block_len: usize,
    capture: VecDeque<f32>,
    render: VecDeque<f32>,
    processed: VecDeque<f32>,
    capture_block: Vec<f32>,
    render_block: Vec<f32>,
    out_block: Vec<f32>,
}

impl Reframer {
    fn new(frame_len: usize, block_len: usize) -> Self {
        let capacity = frame_len + 2 * block_len;
        let mut processed = VecDeque::with_capacity(capacity);
        // Ticks that are not a whole number of blocks need one block of
        // lead so every tick can be answered in full.
        if frame_len % block_len != 0 {
            processed.extend(std::iter::repeat(0.0).take(block_len));
        }

        Self {
            frame_len,
            block_len,
            capture: VecDeque::with_capacity(capacity),
            render: VecDeque::with_capacity(capacity),
            processed,
            capture_block: vec![0.0; block_len],
            render_block: vec![0.0; block_len],
            out_block: vec![0.0; block_len],
        }
    }

    /// Queue one tick, run `process` on every complete block, emit one tick
    fn run<E>(
        &mut self,
        playback: &[i16],
        capture: &[i16],
        out: &mut [i16],
        mut process: impl FnMut(&[f32], &[f32], &mut [f32]) -> Result<(), E>,
    ) -> Result<(), E> {
        self.render.extend(playback.iter().map(|&s| to_float(s)));
        self.capture.extend(capture.iter().map(|&s| to_float(s)));

        while self.capture.len() >= self.block_len {
            for (dst, src) in self.capture_block.iter_mut().zip(self.capture.drain(..self.block_len)) {
                *dst = src;
            }
            for (dst, src) in self.render_block.iter_mut().zip(self.render.drain(..self.block_len)) {
                *dst = src;
            }
            process(&self.capture_block, &self.render_block, &mut self.out_block)?;
            self.processed.extend(self.out_block.iter().copied());
        }

        for (dst, src) in out.iter_mut().zip(self.processed.drain(..self.frame_len)) {
            *dst = to_sample(src);
        }
        Ok(())
    }
}

fn to_float(sample: i16) -> f32 {
    sample as f32 / 32_768.0
}

fn to_sample(value: f32) -> i16 {
    (value * 32_768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// WebRTC AEC3 behind the per-tick contract
pub struct Aec3Canceller {
    aec: VoipAec3,
    reframer: Reframer,
}

impl Aec3Canceller {
    pub fn new(sample_rate: u32, frame_len: usize) -> Result<Self, AudioError> {
        if frame_len == 0 {
            return Err(AudioError::EchoInit("frame length must be positive".into()));
        }
        if !AEC_SAMPLE_RATES.contains(&sample_rate) {
            return Err(AudioError::EchoInit(format!(
                "{} Hz not supported, use one of {:?}",
                sample_rate, AEC_SAMPLE_RATES
            )));
        }

        let aec = VoipAec3::builder(sample_rate as usize, 1, 1)
            .build()
            .map_err(|e| AudioError::EchoInit(format!("{:?}", e)))?;

        Ok(Self {
            aec,
            reframer: Reframer::new(frame_len, (sample_rate / 100) as usize),
        })
    }

    /// Samples per AEC3 block (10 ms)
    pub fn block_len(&self) -> usize {
        self.reframer.block_len
    }
}

impl EchoCanceller for Aec3Canceller {
    fn cancel(&mut self, playback: &[i16], capture: &[i16], out: &mut [i16]) -> Result<(), AudioError> {
        let frame_len = self.reframer.frame_len;
        check_len(frame_len, playback.len())?;
        check_len(frame_len, capture.len())?;
        check_len(frame_len, out.len())?;

        let aec = &mut self.aec;
        self.reframer.run(playback, capture, out, |capture, render, out| {
            aec.process(capture, Some(render), false, out)
                .map(|_| ())
                .map_err(|e| AudioError::EchoFailed(format!("{:?}", e)))
        })
    }
}
