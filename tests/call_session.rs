//! Full calls between two controllers on loopback, with a scripted audio
//! backend standing in for the sound card

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use p2p_voice_call::audio::{AudioBackend, DuplexStream, TickCallback};
use p2p_voice_call::config::{AppConfig, AudioConfig};
use p2p_voice_call::error::{AudioError, CallError, NetworkError};
use p2p_voice_call::network::bind_receive_socket;
use p2p_voice_call::session::{CallController, CallParams, SessionEvent};
use p2p_voice_call::Error;

const FRAME: usize = 64;

/// Feeds a constant microphone frame every tick and records playout
struct ScriptedBackend {
    mic: i16,
    /// Capture frames one sample short, which the pipeline rejects
    bad_input: bool,
    fail_open: bool,
    played: Arc<Mutex<Vec<Vec<i16>>>>,
}

impl ScriptedBackend {
    fn new(mic: i16) -> Self {
        Self {
            mic,
            bad_input: false,
            fail_open: false,
            played: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn heard(&self, level: i16) -> bool {
        self.played
            .lock()
            .iter()
            .any(|frame| frame.iter().all(|&s| s == level))
    }
}

impl AudioBackend for ScriptedBackend {
    fn open_duplex(&self, config: &AudioConfig, callback: TickCallback) -> Result<Box<dyn DuplexStream>, AudioError> {
        if self.fail_open {
            return Err(AudioError::DeviceNotFound("scripted".into()));
        }
        let (error_tx, errors) = unbounded();
        Ok(Box::new(ScriptedStream {
            callback: Some(callback),
            frame_len: config.frames_per_buffer,
            tick: config.frame_duration(),
            mic: self.mic,
            bad_input: self.bad_input,
            played: self.played.clone(),
            running: Arc::new(AtomicBool::new(false)),
            error_tx,
            errors,
            handle: None,
        }))
    }
}

struct ScriptedStream {
    callback: Option<TickCallback>,
    frame_len: usize,
    tick: Duration,
    mic: i16,
    bad_input: bool,
    played: Arc<Mutex<Vec<Vec<i16>>>>,
    running: Arc<AtomicBool>,
    error_tx: Sender<AudioError>,
    errors: Receiver<AudioError>,
    handle: Option<JoinHandle<()>>,
}

impl DuplexStream for ScriptedStream {
    fn start(&mut self) -> Result<(), AudioError> {
        let Some(mut callback) = self.callback.take() else {
            return Err(AudioError::PlayError("already started".into()));
        };
        let input_len = if self.bad_input { self.frame_len - 1 } else { self.frame_len };
        let input = vec![self.mic; input_len];
        let mut output = vec![0; self.frame_len];
        let (tick, played, running, error_tx) = (
            self.tick,
            self.played.clone(),
            self.running.clone(),
            self.error_tx.clone(),
        );

        running.store(true, Ordering::SeqCst);
        self.handle = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                if let Err(e) = callback(Some(&input), &mut output) {
                    let _ = error_tx.send(e);
                    break;
                }
                played.lock().push(output.clone());
                thread::sleep(tick);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.errors.try_recv().ok()
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.audio.sample_rate = 8000;
    config.audio.frames_per_buffer = FRAME;
    config.echo.enabled = false;
    config.controls.gain = 2.0;
    config
}

fn free_port() -> u16 {
    free_ports::<1>()[0]
}

/// Distinct ports, all held until every one is picked
fn free_ports<const N: usize>() -> [u16; N] {
    let sockets: Vec<UdpSocket> = (0..N).map(|_| UdpSocket::bind("0.0.0.0:0").unwrap()).collect();
    std::array::from_fn(|i| sockets[i].local_addr().unwrap().port())
}

fn params(peer_port: u16, local_port: u16) -> CallParams {
    CallParams {
        peer_host: "127.0.0.1".to_string(),
        peer_port,
        local_port,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_two_phones_exchange_audio() {
    let [port_a, port_b] = free_ports();
    let backend_a = Arc::new(ScriptedBackend::new(2000));
    let backend_b = Arc::new(ScriptedBackend::new(0));

    let mut alice = CallController::new(test_config(), backend_a.clone());
    let mut bob = CallController::new(test_config(), backend_b.clone());
    alice.start_call(&params(port_b, port_a)).unwrap();
    bob.start_call(&params(port_a, port_b)).unwrap();
    assert!(alice.is_in_call() && bob.is_in_call());

    // Alice's voice arrives at Bob with gain applied
    let mut bob_events = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        bob_events.extend(bob.poll_events());
        backend_b.heard(4000)
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        bob_events.extend(bob.poll_events());
        bob_events.iter().any(|e| matches!(e, SessionEvent::PlayoutStarted))
    }));
    assert!(bob.elapsed_seconds().is_some());

    // Bob's silent microphone is gated, so Alice only hears silence
    assert!(!backend_a.heard(4000));
    assert!((alice.mic_level() - 2000.0 / 3000.0).abs() < 0.01);
    assert_eq!(bob.mic_level(), 0.0);

    assert!(matches!(
        alice.start_call(&params(port_b, port_a)),
        Err(Error::Call(CallError::AlreadyActive))
    ));

    let summary_a = alice.hang_up().unwrap();
    let summary_b = bob.hang_up().unwrap();
    assert!(summary_a.packets_sent > 0);
    assert!(summary_b.packets_received > 0);
    assert!(summary_b.jitter.played > 0);
    assert!(!alice.is_in_call());
    assert!(matches!(alice.hang_up(), Err(Error::Call(CallError::NotActive))));
}

#[test]
fn test_tunables_persist_across_calls_and_mute_resets() {
    let [port, peer_port] = free_ports();
    let mut phone = CallController::new(test_config(), Arc::new(ScriptedBackend::new(0)));
    assert!(matches!(phone.set_muted(true), Err(Error::Call(CallError::NotActive))));

    phone.start_call(&params(peer_port, port)).unwrap();
    phone.set_gain(3.5);
    phone.set_noise_gate_threshold(2000.0);
    phone.set_muted(true).unwrap();
    assert!(phone.is_muted());
    assert_eq!(phone.session().unwrap().controls().gain(), 3.5);
    phone.hang_up().unwrap();

    phone.start_call(&params(peer_port, port)).unwrap();
    let controls = phone.session().unwrap().controls().clone();
    assert_eq!(controls.gain(), 3.5);
    assert_eq!(controls.noise_gate_threshold(), 1000.0);
    assert!(!phone.is_muted());
    phone.hang_up().unwrap();
}

#[test]
fn test_port_in_use_fails_to_start() {
    let taken = bind_receive_socket(0).unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut phone = CallController::new(test_config(), Arc::new(ScriptedBackend::new(0)));
    match phone.start_call(&params(free_port(), port)) {
        Err(Error::Network(NetworkError::BindFailed { port: p, .. })) => assert_eq!(p, port),
        other => panic!("expected bind failure, got {:?}", other),
    }
    assert!(!phone.is_in_call());
}

#[test]
fn test_device_failure_releases_port() {
    let port = free_port();
    let backend = ScriptedBackend {
        fail_open: true,
        ..ScriptedBackend::new(0)
    };

    let mut phone = CallController::new(test_config(), Arc::new(backend));
    assert!(matches!(
        phone.start_call(&params(free_port(), port)),
        Err(Error::Audio(AudioError::DeviceNotFound(_)))
    ));
    assert!(!phone.is_in_call());
    assert!(bind_receive_socket(port).is_ok());
}

#[test]
fn test_peer_lost_ends_call() {
    let port = free_port();
    let mut phone = CallController::new(test_config(), Arc::new(ScriptedBackend::new(0)));
    phone.start_call(&params(free_port(), port)).unwrap();

    let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
    stranger.send_to(&[], ("127.0.0.1", port)).unwrap();

    let mut events = Vec::new();
    assert!(wait_until(Duration::from_secs(3), || {
        events.extend(phone.poll_events());
        !phone.is_in_call()
    }));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::PeerLost(_))));
    assert!(matches!(events.last(), Some(SessionEvent::CallEnded(_))));
    assert!(bind_receive_socket(port).is_ok());
}

#[test]
fn test_audio_error_ends_call() {
    let port = free_port();
    let backend = ScriptedBackend {
        bad_input: true,
        ..ScriptedBackend::new(500)
    };

    let mut phone = CallController::new(test_config(), Arc::new(backend));
    phone.start_call(&params(free_port(), port)).unwrap();

    let mut events = Vec::new();
    assert!(wait_until(Duration::from_secs(3), || {
        events.extend(phone.poll_events());
        !phone.is_in_call()
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::DeviceFailed(AudioError::FrameSize { .. })
    )));
    assert!(matches!(events.last(), Some(SessionEvent::CallEnded(_))));
}
