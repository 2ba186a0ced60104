//! Duplex stream over cpal
//!
//! cpal only offers separate input and output streams, so the duplex
//! callback is driven from the output stream, which acts as the clock:
//! every time it needs another frame it takes the oldest captured frame
//! (if any) and runs one tick. The streams are `!Send`, so they live on a
//! dedicated owner thread that takes play/pause commands.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Sample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::audio::device::{
    buffer_size_for, find_input_device, find_output_device, AudioBackend, DuplexStream, TickCallback,
};
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Captured frames allowed to queue up before the oldest are dropped
const MAX_CAPTURE_BACKLOG: usize = 2;

/// Backend using the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_duplex(&self, config: &AudioConfig, callback: TickCallback) -> Result<Box<dyn DuplexStream>, AudioError> {
        let stream = CpalDuplexStream::open(config.clone(), callback)?;
        Ok(Box::new(stream))
    }
}

enum StreamCommand {
    Play(Sender<Result<(), AudioError>>),
    Pause(Sender<Result<(), AudioError>>),
}

/// Input + output stream pair owned by a background thread
pub struct CpalDuplexStream {
    commands: Option<Sender<StreamCommand>>,
    error_rx: Receiver<AudioError>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalDuplexStream {
    /// Build both streams. Fails if either device or stream cannot be opened.
    pub fn open(config: AudioConfig, callback: TickCallback) -> Result<Self, AudioError> {
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (command_tx, command_rx) = bounded::<StreamCommand>(4);

        let handle = thread::Builder::new()
            .name("audio-stream".to_string())
            .spawn(move || {
                let (input, output) = match build_streams(&config, callback, error_tx) {
                    Ok(streams) => {
                        let _ = ready_tx.send(Ok(()));
                        streams
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StreamCommand::Play(reply) => {
                            let result = input
                                .play()
                                .and_then(|_| output.play())
                                .map_err(AudioError::from);
                            let _ = reply.send(result);
                        }
                        StreamCommand::Pause(reply) => {
                            let result = output
                                .pause()
                                .and_then(|_| input.pause())
                                .map_err(AudioError::from);
                            let _ = reply.send(result);
                        }
                    }
                }

                // Streams are dropped here, closing the devices
                tracing::debug!("Audio stream thread exiting");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("audio stream thread exited".into()));

        match ready.and_then(|r| r) {
            Ok(()) => Ok(Self {
                commands: Some(command_tx),
                error_rx,
                thread_handle: Some(handle),
            }),
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn send(&self, command: impl FnOnce(Sender<Result<(), AudioError>>) -> StreamCommand) -> Result<(), AudioError> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| AudioError::StreamError("stream closed".into()))?;
        let (reply_tx, reply_rx) = bounded(1);
        commands
            .send(command(reply_tx))
            .map_err(|_| AudioError::StreamError("audio stream thread exited".into()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::StreamError("audio stream thread exited".into()))?
    }
}

impl DuplexStream for CpalDuplexStream {
    fn start(&mut self) -> Result<(), AudioError> {
        self.send(StreamCommand::Play)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.send(StreamCommand::Pause)
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for CpalDuplexStream {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

fn build_streams(
    config: &AudioConfig,
    mut callback: TickCallback,
    errors: Sender<AudioError>,
) -> Result<(cpal::Stream, cpal::Stream), AudioError> {
    let input_device = find_input_device(config.input_device.as_deref())?;
    let output_device = find_output_device(config.output_device.as_deref())?;

    let frame_len = config.frames_per_buffer;
    let channels = config.channels as usize;
    let input_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: buffer_size_for(&input_device.supported_input_configs()?, config),
    };
    let output_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: buffer_size_for(&output_device.supported_output_configs()?, config),
    };

    tracing::info!(
        "Opening duplex stream: in '{}' ({:?}), out '{}' ({:?}), {} Hz, {} ch, {} frames/tick",
        input_device.name,
        input_config.buffer_size,
        output_device.name,
        output_config.buffer_size,
        config.sample_rate,
        channels,
        frame_len
    );

    let (mut writer, reader) = capture_queue(frame_len);
    let input_errors = errors.clone();
    let input = input_device.inner().build_input_stream(
        &input_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for chunk in data.chunks(channels) {
                let mono = chunk.iter().sum::<f32>() / chunk.len() as f32;
                writer.push(mono.to_sample::<i16>());
            }
        },
        move |err| {
            let _ = input_errors.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;

    let mut frame = vec![0i16; frame_len];
    let mut frame_pos = frame_len;
    let mut failed = false;
    let tick_errors = errors.clone();
    let output = output_device.inner().build_output_stream(
        &output_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for out in data.chunks_mut(channels) {
                if frame_pos == frame_len {
                    let captured = reader.next();

                    if failed {
                        frame.fill(0);
                    } else if let Err(e) = callback(captured.as_deref(), &mut frame) {
                        failed = true;
                        frame.fill(0);
                        let _ = tick_errors.try_send(e);
                    }
                    if let Some(buffer) = captured {
                        reader.recycle(buffer);
                    }
                    frame_pos = 0;
                }

                out.fill(frame[frame_pos].to_sample::<f32>());
                frame_pos += 1;
            }
        },
        move |err| {
            let _ = errors.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;

    Ok((input, output))
}

/// Build the capture hand-off between the input and output callbacks.
///
/// Frames travel in buffers drawn from a fixed pool and go back to it once
/// played, so neither real-time callback allocates or frees.
fn capture_queue(frame_len: usize) -> (CaptureWriter, CaptureReader) {
    let queue_len = MAX_CAPTURE_BACKLOG * 2;
    let pool_len = queue_len + 2;
    let (frame_tx, frame_rx) = bounded::<Vec<i16>>(queue_len);
    let (free_tx, free_rx) = bounded::<Vec<i16>>(pool_len);
    for _ in 0..pool_len {
        let _ = free_tx.try_send(Vec::with_capacity(frame_len));
    }

    (
        CaptureWriter {
            frame_len,
            pending: None,
            frames: frame_tx,
            free: free_rx,
        },
        CaptureReader {
            frames: frame_rx,
            free: free_tx,
        },
    )
}

/// Input side: assembles mono samples into frames
struct CaptureWriter {
    frame_len: usize,
    pending: Option<Vec<i16>>,
    frames: Sender<Vec<i16>>,
    free: Receiver<Vec<i16>>,
}

impl CaptureWriter {
    fn push(&mut self, sample: i16) {
        if self.pending.is_none() {
            self.pending = self.free.try_recv().ok();
        }
        // Pool exhausted: the output side holds every buffer
        let Some(frame) = self.pending.as_mut() else {
            return;
        };

        frame.push(sample);
        if frame.len() < self.frame_len {
            return;
        }
        if let Some(full) = self.pending.take() {
            if let Err(e) = self.frames.try_send(full) {
                // Output side stalled; reuse the buffer
                let mut full = e.into_inner();
                full.clear();
                self.pending = Some(full);
            }
        }
    }
}

/// Output side: takes the next captured frame, dropping stale backlog
struct CaptureReader {
    frames: Receiver<Vec<i16>>,
    free: Sender<Vec<i16>>,
}

impl CaptureReader {
    fn next(&self) -> Option<Vec<i16>> {
        while self.frames.len() > MAX_CAPTURE_BACKLOG {
            if let Ok(stale) = self.frames.try_recv() {
                self.recycle(stale);
            }
        }
        self.frames.try_recv().ok()
    }

    fn recycle(&self, mut buffer: Vec<i16>) {
        buffer.clear();
        let _ = self.free.try_send(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn push_frame(writer: &mut CaptureWriter, value: i16, frame_len: usize) {
        for _ in 0..frame_len {
            writer.push(value);
        }
    }

    #[test]
    fn test_frames_arrive_whole_and_in_order() {
        let (mut writer, reader) = capture_queue(4);
        writer.push(1);
        writer.push(2);
        assert!(reader.next().is_none());

        writer.push(3);
        writer.push(4);
        writer.push(5);
        assert_eq!(reader.next().as_deref(), Some(&[1, 2, 3, 4][..]));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_buffers_are_recycled() {
        const FRAME: usize = 32;
        let (mut writer, reader) = capture_queue(FRAME);
        let mut seen = HashSet::new();

        for n in 0..200 {
            push_frame(&mut writer, n, FRAME);
            let frame = reader.next().unwrap();
            assert_eq!(frame, vec![n; FRAME]);
            assert_eq!(frame.capacity(), FRAME);
            seen.insert(frame.as_ptr() as usize);
            reader.recycle(frame);
        }

        assert!(seen.len() <= MAX_CAPTURE_BACKLOG * 2 + 2);
    }

    #[test]
    fn test_backlog_is_trimmed() {
        const FRAME: usize = 8;
        let (mut writer, reader) = capture_queue(FRAME);
        for n in 1..=6 {
            push_frame(&mut writer, n, FRAME);
        }

        // Queue holds frames 1..=4; 5 and 6 were dropped at the input side.
        // The oldest two are discarded to bound latency.
        assert_eq!(reader.next(), Some(vec![3; FRAME]));
        assert_eq!(reader.next(), Some(vec![4; FRAME]));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn test_writer_waits_for_free_buffer() {
        const FRAME: usize = 2;
        let (mut writer, reader) = capture_queue(FRAME);

        // Hold every buffer on the output side
        let held: Vec<Vec<i16>> = (0..MAX_CAPTURE_BACKLOG * 2 + 2)
            .map(|n| {
                push_frame(&mut writer, n as i16, FRAME);
                reader.frames.try_recv().unwrap()
            })
            .collect();

        push_frame(&mut writer, 99, FRAME);
        assert!(reader.next().is_none());

        for buffer in held {
            reader.recycle(buffer);
        }
        push_frame(&mut writer, 7, FRAME);
        assert_eq!(reader.next(), Some(vec![7; FRAME]));
    }
}
