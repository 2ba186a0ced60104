//! Call lifecycle
//!
//! A [`CallSession`] is built fresh for every call and owns everything the
//! call needs: sockets, buffers, the device stream (which in turn owns the
//! echo canceller) and the two network threads. [`CallController`] is the
//! surface the user interface talks to; it holds at most one session.

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;
use uuid::Uuid;

use crate::audio::buffer::{create_shared_buffer, JitterBuffer, JitterBufferStats, SharedJitterBuffer, SharedRingBuffer};
use crate::audio::device::{AudioBackend, DuplexStream};
use crate::audio::echo::create_echo_canceller;
use crate::audio::pipeline::AudioPipeline;
use crate::config::AppConfig;
use crate::constants::{GAIN_RANGE, MIC_LEVEL_FULL_SCALE, NOISE_GATE_RANGE};
use crate::error::{AudioError, CallError, Result};
use crate::network::{
    bind_receive_socket, create_send_socket, resolve_peer, wake_receiver, AudioReceiver, AudioSender,
    ReceiverExit, ReceiverStats, SenderStats,
};

/// Tunables and live state shared between the UI, audio and network threads.
///
/// Every field is an atomic scalar, so no lock is taken on the audio path.
#[derive(Debug)]
pub struct CallControls {
    gain: AtomicU32,
    noise_gate_threshold: AtomicU32,
    muted: AtomicBool,
    running: AtomicBool,
    mic_level: AtomicU32,
    playout_started: OnceLock<Instant>,
}

impl CallControls {
    pub fn new(gain: f32, noise_gate_threshold: f32) -> Self {
        Self {
            gain: AtomicU32::new(clamp_gain(gain).to_bits()),
            noise_gate_threshold: AtomicU32::new(clamp_gate(noise_gate_threshold).to_bits()),
            muted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            mic_level: AtomicU32::new(0f32.to_bits()),
            playout_started: OnceLock::new(),
        }
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(clamp_gain(gain).to_bits(), Ordering::Relaxed);
    }

    pub fn noise_gate_threshold(&self) -> f32 {
        f32::from_bits(self.noise_gate_threshold.load(Ordering::Relaxed))
    }

    pub fn set_noise_gate_threshold(&self, threshold: f32) {
        self.noise_gate_threshold
            .store(clamp_gate(threshold).to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Latest RMS of the processed microphone signal
    pub fn mic_level(&self) -> f32 {
        f32::from_bits(self.mic_level.load(Ordering::Relaxed))
    }

    pub fn set_mic_level(&self, rms: f32) {
        self.mic_level.store(rms.to_bits(), Ordering::Relaxed);
    }

    /// Mic level as a 0.0..=1.0 meter fraction
    pub fn mic_level_fraction(&self) -> f32 {
        (self.mic_level() / MIC_LEVEL_FULL_SCALE).min(1.0)
    }

    /// Start the call timer. Returns `true` only for the first call.
    pub fn mark_playout_started(&self) -> bool {
        let mut first = false;
        self.playout_started.get_or_init(|| {
            first = true;
            Instant::now()
        });
        first
    }

    /// Whole seconds since playout started, `None` before that
    pub fn elapsed_seconds(&self) -> Option<u64> {
        self.playout_started.get().map(|start| start.elapsed().as_secs())
    }
}

fn clamp_gain(gain: f32) -> f32 {
    gain.clamp(GAIN_RANGE.0, GAIN_RANGE.1)
}

fn clamp_gate(threshold: f32) -> f32 {
    threshold.clamp(NOISE_GATE_RANGE.0, NOISE_GATE_RANGE.1)
}

/// Format seconds as `MM:SS`
pub fn format_elapsed(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Parameters supplied when the user places a call
#[derive(Debug, Clone)]
pub struct CallParams {
    pub peer_host: String,
    pub peer_port: u16,
    pub local_port: u16,
}

/// Notifications from a running call
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// First packet seen with the jitter buffer primed; call timer started
    PlayoutStarted,
    /// The receive loop ended while the call was running
    PeerLost(String),
    /// The audio device or echo canceller failed
    DeviceFailed(AudioError),
    /// The controller tore the call down after a failure
    CallEnded(CallSummary),
}

/// What is left of a call after hangup
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
    /// Seconds of playout, `None` if audio never arrived
    pub talk_seconds: Option<u64>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub invalid_packets: u64,
    pub jitter: JitterBufferStats,
}

/// One active call
pub struct CallSession {
    id: Uuid,
    peer: SocketAddr,
    started_at: DateTime<Utc>,
    controls: Arc<CallControls>,
    ring: SharedRingBuffer,
    jitter: SharedJitterBuffer,
    recv_socket: Arc<UdpSocket>,
    stream: Option<Box<dyn DuplexStream>>,
    sender_handle: Option<JoinHandle<()>>,
    receiver_handle: Option<JoinHandle<ReceiverExit>>,
    sender_stats: Arc<SenderStats>,
    receiver_stats: Arc<ReceiverStats>,
    events: Receiver<SessionEvent>,
    closed: bool,
}

impl CallSession {
    /// Bind, open the device and start both network loops.
    ///
    /// Any failure releases whatever was already set up before returning.
    pub fn start(
        params: &CallParams,
        config: &AppConfig,
        backend: &dyn AudioBackend,
        controls: Arc<CallControls>,
    ) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let span = tracing::info_span!("call", id = %id);
        let _enter = span.enter();

        let peer = resolve_peer(&params.peer_host, params.peer_port)?;
        let recv_socket = Arc::new(bind_receive_socket(params.local_port)?);
        let send_socket = Arc::new(create_send_socket()?);
        tracing::info!("Calling {} from local port {}", peer, params.local_port);

        let frame_len = config.audio.frames_per_buffer;
        let ring = create_shared_buffer(config.audio.ring_buffer_samples());
        let jitter = Arc::new(JitterBuffer::new(
            config.jitter.capacity,
            config.jitter.min_playout_delay,
            frame_len,
        ));
        let echo = create_echo_canceller(&config.echo, config.audio.sample_rate, frame_len)?;

        let mut pipeline = AudioPipeline::new(jitter.clone(), ring.clone(), echo, controls.clone());
        let mut stream = backend.open_duplex(
            &config.audio,
            Box::new(move |input: Option<&[i16]>, output: &mut [i16]| {
                pipeline.process(input, output).map(|_| ())
            }),
        )?;
        stream.start()?;

        controls.set_running(true);

        let (event_tx, event_rx) = unbounded();
        let sender = AudioSender::new(
            send_socket,
            peer,
            ring.clone(),
            controls.clone(),
            frame_len,
            config.send_interval(),
        );
        let receiver = AudioReceiver::new(recv_socket.clone(), jitter.clone(), controls.clone(), event_tx);
        let sender_stats = sender.stats();
        let receiver_stats = receiver.stats();

        let mut session = Self {
            id,
            peer,
            started_at: Utc::now(),
            controls,
            ring,
            jitter,
            recv_socket,
            stream: Some(stream),
            sender_handle: None,
            receiver_handle: None,
            sender_stats,
            receiver_stats,
            events: event_rx,
            closed: false,
        };

        // On failure `session` drops here and tears down what exists.
        session.sender_handle = Some(sender.spawn(span.clone())?);
        session.receiver_handle = Some(receiver.spawn(span.clone())?);

        tracing::info!("Call initiated");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn controls(&self) -> &Arc<CallControls> {
        &self.controls
    }

    pub fn ring_buffer(&self) -> &SharedRingBuffer {
        &self.ring
    }

    pub fn jitter_buffer(&self) -> &SharedJitterBuffer {
        &self.jitter
    }

    pub fn sender_stats(&self) -> &Arc<SenderStats> {
        &self.sender_stats
    }

    pub fn receiver_stats(&self) -> &Arc<ReceiverStats> {
        &self.receiver_stats
    }

    /// Drain pending network and device events
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        let mut events: Vec<SessionEvent> = self.events.try_iter().collect();
        if let Some(stream) = &self.stream {
            while let Some(e) = stream.check_errors() {
                tracing::error!("Audio device failure: {}", e);
                events.push(SessionEvent::DeviceFailed(e));
            }
        }
        events
    }

    /// End the call: stop the loops, close sockets, stop the device
    pub fn hangup(mut self) -> CallSummary {
        self.shutdown();
        self.summary()
    }

    fn summary(&self) -> CallSummary {
        CallSummary {
            id: self.id,
            peer: self.peer,
            started_at: self.started_at,
            talk_seconds: self.controls.elapsed_seconds(),
            packets_sent: self.sender_stats.packets_sent(),
            packets_received: self.receiver_stats.packets_received(),
            invalid_packets: self.receiver_stats.invalid_packets(),
            jitter: self.jitter.stats(),
        }
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let span = tracing::info_span!("call", id = %self.id);
        let _enter = span.enter();

        self.controls.set_running(false);
        wake_receiver(&self.recv_socket);

        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.stop() {
                tracing::warn!("Failed to stop audio stream: {}", e);
            }
        }

        if let Some(handle) = self.sender_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Sender thread panicked");
            }
        }
        if let Some(handle) = self.receiver_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Receiver thread panicked");
            }
        }

        let stats = self.jitter.stats();
        tracing::info!(
            "Call ended: {} sent, {} received, {} played, {} concealed, {} late",
            self.sender_stats.packets_sent(),
            self.receiver_stats.packets_received(),
            stats.played,
            stats.concealed,
            stats.late
        );
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Entry point for the user interface; at most one call at a time
pub struct CallController {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    gain: f32,
    noise_gate_threshold: f32,
    session: Option<CallSession>,
}

impl CallController {
    pub fn new(config: AppConfig, backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            gain: clamp_gain(config.controls.gain),
            noise_gate_threshold: clamp_gate(config.controls.noise_gate_threshold),
            config,
            backend,
            session: None,
        }
    }

    /// Place a call. Fails with [`CallError::AlreadyActive`] while one is running.
    pub fn start_call(&mut self, params: &CallParams) -> Result<()> {
        if self.session.is_some() {
            return Err(CallError::AlreadyActive.into());
        }

        let controls = Arc::new(CallControls::new(self.gain, self.noise_gate_threshold));
        match CallSession::start(params, &self.config, self.backend.as_ref(), controls) {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Call setup failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn hang_up(&mut self) -> Result<CallSummary> {
        let session = self.session.take().ok_or(CallError::NotActive)?;
        Ok(session.hangup())
    }

    pub fn is_in_call(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Applies to the current call and every later one
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = clamp_gain(gain);
        if let Some(session) = &self.session {
            session.controls().set_gain(self.gain);
        }
    }

    pub fn noise_gate_threshold(&self) -> f32 {
        self.noise_gate_threshold
    }

    /// Applies to the current call and every later one
    pub fn set_noise_gate_threshold(&mut self, threshold: f32) {
        self.noise_gate_threshold = clamp_gate(threshold);
        if let Some(session) = &self.session {
            session.controls().set_noise_gate_threshold(self.noise_gate_threshold);
        }
    }

    /// Mute lasts for the current call only
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        let session = self.session.as_ref().ok_or(CallError::NotActive)?;
        session.controls().set_muted(muted);
        tracing::info!("Mute {}", if muted { "ON" } else { "OFF" });
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.controls().is_muted())
            .unwrap_or(false)
    }

    /// Mic meter fraction, zero when idle
    pub fn mic_level(&self) -> f32 {
        self.session
            .as_ref()
            .map(|s| s.controls().mic_level_fraction())
            .unwrap_or(0.0)
    }

    /// Call timer, `None` when idle or before audio arrives
    pub fn elapsed_seconds(&self) -> Option<u64> {
        self.session.as_ref().and_then(|s| s.controls().elapsed_seconds())
    }

    /// Drain call events. A lost peer or a failed device ends the call,
    /// which is reported as a trailing [`SessionEvent::CallEnded`].
    pub fn poll_events(&mut self) -> Vec<SessionEvent> {
        let Some(session) = &self.session else {
            return Vec::new();
        };

        let mut events = session.poll_events();
        let fatal = events
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerLost(_) | SessionEvent::DeviceFailed(_)));

        if fatal {
            if let Some(session) = self.session.take() {
                events.push(SessionEvent::CallEnded(session.hangup()));
            }
        }
        events
    }
}
