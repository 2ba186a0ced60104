//! Inbound transport loop
//!
//! Blocks on the receive socket, validates each datagram's size and puts
//! well-formed packets into the jitter buffer. A zero-length datagram or a
//! socket error while the call is running means the peer link is gone.

use crossbeam_channel::Sender;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::buffer::{PutOutcome, SharedJitterBuffer};
use crate::protocol::{packet_size, AudioPacket};
use crate::session::{CallControls, SessionEvent};

/// Receiver statistics
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub invalid_packets: AtomicU64,
    pub late_packets: AtomicU64,
}

impl ReceiverStats {
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn invalid_packets(&self) -> u64 {
        self.invalid_packets.load(Ordering::Relaxed)
    }
}

/// Why the receive loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverExit {
    /// The call was stopped locally
    Stopped,
    /// Zero-length datagram or socket error while running
    PeerLost(String),
}

/// UDP receiver for one call
pub struct AudioReceiver {
    socket: Arc<UdpSocket>,
    jitter: SharedJitterBuffer,
    controls: Arc<CallControls>,
    events: Sender<SessionEvent>,
    stats: Arc<ReceiverStats>,
}

impl AudioReceiver {
    pub fn new(
        socket: Arc<UdpSocket>,
        jitter: SharedJitterBuffer,
        controls: Arc<CallControls>,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self {
            socket,
            jitter,
            controls,
            events,
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    /// Run the loop on a named thread inside `span`
    pub fn spawn(self, span: tracing::Span) -> std::io::Result<JoinHandle<ReceiverExit>> {
        thread::Builder::new()
            .name("udp-receiver".to_string())
            .spawn(move || {
                let _guard = span.enter();
                self.run()
            })
    }

    /// Receive until stopped or the peer link drops
    pub fn run(self) -> ReceiverExit {
        let frame_len = self.jitter.frame_len();
        let expected = packet_size(frame_len);
        // One spare byte so oversized datagrams are seen as such
        let mut buf = vec![0u8; expected + 1];
        let mut packet = AudioPacket::silent(frame_len);
        let mut announced = false;

        tracing::info!("Receiver started on {:?}", self.socket.local_addr());

        let exit = loop {
            if !self.controls.is_running() {
                break ReceiverExit::Stopped;
            }

            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.controls.is_running() {
                        tracing::error!("Receive failed: {}", e);
                        break ReceiverExit::PeerLost(e.to_string());
                    }
                    break ReceiverExit::Stopped;
                }
            };

            if n == 0 {
                if self.controls.is_running() {
                    tracing::warn!("Zero-length datagram from {}, treating peer as gone", from);
                    break ReceiverExit::PeerLost("zero-length datagram".into());
                }
                break ReceiverExit::Stopped;
            }

            if let Err(e) = packet.decode_into(&buf[..n]) {
                let invalid = self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                if invalid < 5 {
                    tracing::warn!("Discarding datagram from {}: {}", from, e);
                }
                continue;
            }

            self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            if self.jitter.put(&packet) == PutOutcome::Late {
                self.stats.late_packets.fetch_add(1, Ordering::Relaxed);
            }

            if !announced && self.jitter.is_primed() {
                announced = true;
                if self.controls.mark_playout_started() {
                    tracing::info!("Playout started, call timer running");
                    let _ = self.events.send(SessionEvent::PlayoutStarted);
                }
            }
        };

        if let ReceiverExit::PeerLost(reason) = &exit {
            let _ = self.events.send(SessionEvent::PeerLost(reason.clone()));
        }

        tracing::info!(
            "Receiver finished ({:?}): {} packets, {} invalid",
            exit,
            self.stats.packets_received(),
            self.stats.invalid_packets()
        );
        exit
    }
}
