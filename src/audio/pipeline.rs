//! Per-tick duplex audio processing
//!
//! [`AudioPipeline::process`] is what the device driver calls once per
//! tick. It must stay short and never touch the network: it only locks
//! the jitter buffer and the ring buffer for the length of a copy.

use std::sync::Arc;

use crate::audio::buffer::{Playout, SharedJitterBuffer, SharedRingBuffer};
use crate::audio::echo::EchoCanceller;
use crate::error::AudioError;
use crate::session::CallControls;

/// What happened to the captured frame on one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    /// Above the gate; gained and enqueued
    Voice,
    /// Below the gate; silence enqueued
    Gated,
    /// Muted; silence enqueued
    Muted,
    /// No capture this tick; nothing enqueued
    NoInput,
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub playout: Playout,
    pub outbound: Outbound,
    /// RMS of the echo-cancelled capture, when there was one
    pub rms: Option<f32>,
}

/// Root-mean-square energy of a frame
pub fn frame_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Scale `input` by `gain` into `out`, hard-clipping to the i16 range
pub fn apply_gain(input: &[i16], gain: f32, out: &mut [i16]) {
    for (dst, &src) in out.iter_mut().zip(input) {
        let boosted = (src as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32);
        *dst = boosted as i16;
    }
}

/// Capture → echo cancel → gate/gain → ring buffer, and jitter buffer → playout
pub struct AudioPipeline {
    jitter: SharedJitterBuffer,
    ring: SharedRingBuffer,
    echo: Box<dyn EchoCanceller>,
    controls: Arc<CallControls>,
    frame_len: usize,
    cancelled: Vec<i16>,
    outbound: Vec<i16>,
}

impl AudioPipeline {
    pub fn new(
        jitter: SharedJitterBuffer,
        ring: SharedRingBuffer,
        echo: Box<dyn EchoCanceller>,
        controls: Arc<CallControls>,
    ) -> Self {
        let frame_len = jitter.frame_len();
        Self {
            jitter,
            ring,
            echo,
            controls,
            frame_len,
            cancelled: vec![0; frame_len],
            outbound: vec![0; frame_len],
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Run one device tick.
    ///
    /// `output` is always filled with exactly one frame of playout. An
    /// error means the call can no longer run.
    pub fn process(&mut self, input: Option<&[i16]>, output: &mut [i16]) -> Result<TickReport, AudioError> {
        if output.len() != self.frame_len {
            return Err(AudioError::FrameSize {
                expected: self.frame_len,
                actual: output.len(),
            });
        }

        let playout = self.jitter.get(output);

        let Some(capture) = input else {
            return Ok(TickReport {
                playout,
                outbound: Outbound::NoInput,
                rms: None,
            });
        };

        self.echo.cancel(output, capture, &mut self.cancelled)?;

        let rms = frame_rms(&self.cancelled);
        self.controls.set_mic_level(rms);

        let outbound = if self.controls.is_muted() {
            Outbound::Muted
        } else if rms > self.controls.noise_gate_threshold() {
            Outbound::Voice
        } else {
            Outbound::Gated
        };

        match outbound {
            Outbound::Voice => apply_gain(&self.cancelled, self.controls.gain(), &mut self.outbound),
            _ => self.outbound.fill(0),
        }
        self.ring.write(&self.outbound);

        Ok(TickReport {
            playout,
            outbound,
            rms: Some(rms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{create_shared_buffer, JitterBuffer};
    use crate::audio::echo::PassthroughCanceller;
    use crate::protocol::AudioPacket;

    const FRAME: usize = 16;

    struct Harness {
        pipeline: AudioPipeline,
        jitter: SharedJitterBuffer,
        ring: SharedRingBuffer,
        controls: Arc<CallControls>,
    }

    fn harness(gain: f32, threshold: f32) -> Harness {
        let jitter = Arc::new(JitterBuffer::new(8, 1, FRAME));
        let ring = create_shared_buffer(FRAME * 4);
        let controls = Arc::new(CallControls::new(gain, threshold));
        let pipeline = AudioPipeline::new(
            jitter.clone(),
            ring.clone(),
            Box::new(PassthroughCanceller::new(FRAME)),
            controls.clone(),
        );
        Harness {
            pipeline,
            jitter,
            ring,
            controls,
        }
    }

    fn drain(ring: &SharedRingBuffer) -> Vec<i16> {
        let mut out = vec![0; FRAME];
        ring.read(&mut out);
        out
    }

    #[test]
    fn test_rms() {
        assert_eq!(frame_rms(&[]), 0.0);
        assert_eq!(frame_rms(&[3, -3, 3, -3]), 3.0);
        assert!((frame_rms(&[300, 400]) - 353.553).abs() < 0.01);
    }

    #[test]
    fn test_gain_clips_without_wrapping() {
        let mut out = [0; 4];
        apply_gain(&[20_000, -20_000, 100, -1], 2.0, &mut out);
        assert_eq!(out, [i16::MAX, i16::MIN, 200, -2]);
    }

    #[test]
    fn test_voice_is_gained_and_enqueued() {
        let mut h = harness(1.5, 150.0);
        let capture = vec![1000; FRAME];
        let mut out = vec![0; FRAME];

        let report = h.pipeline.process(Some(&capture), &mut out).unwrap();
        assert_eq!(report.outbound, Outbound::Voice);
        assert_eq!(report.rms, Some(1000.0));
        assert_eq!(h.controls.mic_level(), 1000.0);
        assert_eq!(drain(&h.ring), vec![1500; FRAME]);
    }

    #[test]
    fn test_loud_frame_clipped() {
        let mut h = harness(5.0, 150.0);
        let capture: Vec<i16> = (0..FRAME).map(|i| if i % 2 == 0 { 30_000 } else { -30_000 }).collect();
        let mut out = vec![0; FRAME];

        h.pipeline.process(Some(&capture), &mut out).unwrap();
        let sent = drain(&h.ring);
        assert!(sent.iter().all(|&s| s == i16::MAX || s == i16::MIN));
    }

    #[test]
    fn test_quiet_frame_gated_to_silence() {
        let mut h = harness(5.0, 150.0);
        let capture = vec![100; FRAME];
        let mut out = vec![0; FRAME];

        let report = h.pipeline.process(Some(&capture), &mut out).unwrap();
        assert_eq!(report.outbound, Outbound::Gated);
        assert_eq!(h.ring.cursors().0, FRAME);
        assert_eq!(drain(&h.ring), vec![0; FRAME]);
    }

    #[test]
    fn test_frame_at_threshold_is_gated() {
        let mut h = harness(2.0, 150.0);
        let capture = vec![150; FRAME];
        let mut out = vec![0; FRAME];

        let report = h.pipeline.process(Some(&capture), &mut out).unwrap();
        assert_eq!(report.rms, Some(150.0));
        assert_eq!(report.outbound, Outbound::Gated);
        assert_eq!(drain(&h.ring), vec![0; FRAME]);
    }

    #[test]
    fn test_no_input_enqueues_nothing() {
        let mut h = harness(1.2, 150.0);
        let mut out = vec![0; FRAME];

        let report = h.pipeline.process(None, &mut out).unwrap();
        assert_eq!(report.outbound, Outbound::NoInput);
        assert_eq!(report.rms, None);
        assert_eq!(h.ring.cursors(), (0, 0));
    }

    #[test]
    fn test_muted_sends_silence_but_meters() {
        let mut h = harness(1.0, 0.0);
        h.controls.set_muted(true);
        let capture = vec![2000; FRAME];
        let mut out = vec![0; FRAME];

        let report = h.pipeline.process(Some(&capture), &mut out).unwrap();
        assert_eq!(report.outbound, Outbound::Muted);
        assert_eq!(h.controls.mic_level(), 2000.0);
        assert_eq!(drain(&h.ring), vec![0; FRAME]);
    }

    #[test]
    fn test_playout_comes_from_jitter_buffer() {
        let mut h = harness(1.0, 150.0);
        h.jitter.put(&AudioPacket::new(0, vec![42; FRAME]));
        let mut out = vec![0; FRAME];

        let report = h.pipeline.process(None, &mut out).unwrap();
        assert_eq!(report.playout, Playout::Played(0));
        assert_eq!(out, vec![42; FRAME]);
    }

    #[test]
    fn test_wrong_capture_length_is_fatal() {
        let mut h = harness(1.0, 150.0);
        let mut out = vec![0; FRAME];
        let result = h.pipeline.process(Some(&[0; 3]), &mut out);
        assert!(matches!(result, Err(AudioError::FrameSize { .. })));
    }
}
