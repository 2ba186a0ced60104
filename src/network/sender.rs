//! Outbound transport loop
//!
//! Drains one frame from the sample ring buffer per pacing interval, wraps
//! it in a sequenced packet and sends it to the peer. Fire-and-forget: no
//! acknowledgement, no retransmission.

use bytes::BytesMut;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::SharedRingBuffer;
use crate::protocol::AudioPacket;
use crate::session::CallControls;

/// Sender statistics
#[derive(Debug, Default)]
pub struct SenderStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    /// Sequence number the next packet will carry
    pub next_sequence: AtomicU32,
}

impl SenderStats {
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Paced UDP sender for one call
pub struct AudioSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    ring: SharedRingBuffer,
    controls: Arc<CallControls>,
    frame_len: usize,
    interval: Duration,
    first_sequence: u32,
    stats: Arc<SenderStats>,
}

impl AudioSender {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        ring: SharedRingBuffer,
        controls: Arc<CallControls>,
        frame_len: usize,
        interval: Duration,
    ) -> Self {
        Self {
            socket,
            peer,
            ring,
            controls,
            frame_len,
            interval,
            first_sequence: 0,
            stats: Arc::new(SenderStats::default()),
        }
    }

    /// Number the first packet `sequence` instead of 0
    pub fn with_first_sequence(mut self, sequence: u32) -> Self {
        self.first_sequence = sequence;
        self
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Run the loop on a named thread inside `span`
    pub fn spawn(self, span: tracing::Span) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("udp-sender".to_string())
            .spawn(move || {
                let _guard = span.enter();
                self.run();
            })
    }

    /// Send until the call stops running
    pub fn run(self) {
        tracing::info!("Sender started, peer {}, every {:?}", self.peer, self.interval);

        let mut packet = AudioPacket::silent(self.frame_len);
        let mut buf = BytesMut::with_capacity(packet.wire_size());
        let mut sequence = self.first_sequence;
        let mut next_send = Instant::now();

        while self.controls.is_running() {
            self.ring.read(&mut packet.samples);
            packet.sequence = sequence;
            sequence = sequence.wrapping_add(1);
            self.stats.next_sequence.store(sequence, Ordering::Relaxed);

            buf.clear();
            packet.encode_into(&mut buf);

            match self.socket.send_to(&buf, self.peer) {
                Ok(n) => {
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    let errors = self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    // Only the first few; an unreachable peer fails every packet
                    if errors < 5 {
                        tracing::warn!("Failed to send packet {}: {}", packet.sequence, e);
                    }
                }
            }

            next_send += self.interval;
            let now = Instant::now();
            if next_send > now {
                thread::sleep(next_send - now);
            } else if now - next_send > self.interval * 4 {
                // Fell far behind (suspended?); restart the schedule
                next_send = now;
            }
        }

        tracing::info!(
            "Sender finished: {} packets, {} bytes",
            self.stats.packets_sent(),
            self.stats.bytes_sent()
        );
    }
}
