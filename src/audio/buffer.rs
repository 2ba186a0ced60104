//! Sample ring buffer and jitter buffer
//!
//! Both buffers are shared between the real-time audio thread and one
//! network thread. Each guards its state with a single short-held mutex;
//! neither ever blocks waiting for data.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::protocol::AudioPacket;

/// Outbound sample queue between the audio callback and the sender loop.
///
/// Writes always succeed and overwrite whatever lies under the write
/// cursor, read or not. Reads always return the requested number of
/// samples from the read cursor, whether or not the writer has produced
/// them yet. There is no full/empty detection: the callback must never
/// wait on the network, so lost or repeated audio is the accepted cost.
pub struct SampleRingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
}

struct RingState {
    samples: Box<[i16]>,
    write_pos: usize,
    read_pos: usize,
}

impl SampleRingBuffer {
    /// Create a zero-filled ring holding `capacity` samples
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be positive");
        Self {
            state: Mutex::new(RingState {
                samples: vec![0; capacity].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
            }),
            capacity,
        }
    }

    /// Copy `samples` in at the write cursor, wrapping and overwriting.
    /// Returns the number of samples written.
    pub fn write(&self, samples: &[i16]) -> usize {
        let mut state = self.state.lock();
        let mut remaining = samples;
        while !remaining.is_empty() {
            let start = state.write_pos;
            let n = remaining.len().min(self.capacity - start);
            state.samples[start..start + n].copy_from_slice(&remaining[..n]);
            state.write_pos = (start + n) % self.capacity;
            remaining = &remaining[n..];
        }
        samples.len()
    }

    /// Fill `out` from the read cursor, wrapping.
    /// Returns the number of samples read.
    pub fn read(&self, out: &mut [i16]) -> usize {
        let mut state = self.state.lock();
        let mut filled = 0;
        while filled < out.len() {
            let start = state.read_pos;
            let n = (out.len() - filled).min(self.capacity - start);
            out[filled..filled + n].copy_from_slice(&state.samples[start..start + n]);
            state.read_pos = (start + n) % self.capacity;
            filled += n;
        }
        filled
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current (write, read) cursor positions
    pub fn cursors(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.write_pos, state.read_pos)
    }
}

/// Thread-safe handle to a sample ring buffer
pub type SharedRingBuffer = Arc<SampleRingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(SampleRingBuffer::new(capacity))
}

/// `true` when `a` precedes `b` in 32-bit serial number order (RFC 1982)
pub fn seq_before(a: u32, b: u32) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < 0x8000_0000
}

/// What a [`JitterBuffer::put`] did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored in an empty slot
    Stored,
    /// Stored over an unplayed occupant of the same slot
    Replaced,
    /// Older than the playout cursor, dropped
    Late,
}

/// What a [`JitterBuffer::get`] produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playout {
    /// Still building the playout cushion; silence emitted
    Priming,
    /// Packet with this sequence number played
    Played(u32),
    /// Nothing for this sequence number; silence emitted
    Concealed(u32),
}

impl Playout {
    pub fn is_silent(&self) -> bool {
        !matches!(self, Playout::Played(_))
    }
}

/// One jitter buffer slot; the occupancy flag is explicit, never a sentinel
struct Slot {
    sequence: u32,
    samples: Box<[i16]>,
    occupied: bool,
}

struct JitterState {
    slots: Vec<Slot>,
    next_seq_to_play: u32,
    is_primed: bool,
    stats: JitterBufferStats,
}

/// Sequence-indexed playout buffer for received frames.
///
/// Packets land in slot `sequence % capacity`. Playout waits until
/// `min_playout_delay` slots are occupied, starts at the lowest buffered
/// sequence number, then advances the cursor by exactly one per `get`,
/// emitting silence for anything missing.
pub struct JitterBuffer {
    state: Mutex<JitterState>,
    capacity: usize,
    min_playout_delay: usize,
    frame_len: usize,
}

impl JitterBuffer {
    /// Create a jitter buffer of `capacity` slots, each holding `frame_len` samples
    pub fn new(capacity: usize, min_playout_delay: usize, frame_len: usize) -> Self {
        assert!(capacity > 0, "Capacity must be positive");
        assert!(min_playout_delay > 0, "Playout delay must be positive");
        assert!(
            min_playout_delay <= capacity,
            "Playout delay cannot exceed capacity"
        );

        let slots = (0..capacity)
            .map(|_| Slot {
                sequence: 0,
                samples: vec![0; frame_len].into_boxed_slice(),
                occupied: false,
            })
            .collect();

        Self {
            state: Mutex::new(JitterState {
                slots,
                next_seq_to_play: 0,
                is_primed: false,
                stats: JitterBufferStats {
                    capacity,
                    ..Default::default()
                },
            }),
            capacity,
            min_playout_delay,
            frame_len,
        }
    }

    fn index(&self, sequence: u32) -> usize {
        (sequence % self.capacity as u32) as usize
    }

    /// Insert a received packet
    pub fn put(&self, packet: &AudioPacket) -> PutOutcome {
        let mut state = self.state.lock();

        if state.is_primed && seq_before(packet.sequence, state.next_seq_to_play) {
            state.stats.late += 1;
            return PutOutcome::Late;
        }

        let index = self.index(packet.sequence);
        let slot = &mut state.slots[index];
        let outcome = if slot.occupied {
            PutOutcome::Replaced
        } else {
            PutOutcome::Stored
        };

        let n = packet.samples.len().min(self.frame_len);
        slot.samples[..n].copy_from_slice(&packet.samples[..n]);
        slot.samples[n..].fill(0);
        slot.sequence = packet.sequence;
        slot.occupied = true;

        state.stats.received += 1;
        if outcome == PutOutcome::Replaced {
            state.stats.overwritten += 1;
        }
        outcome
    }

    /// Produce exactly one frame of playout into `out`
    pub fn get(&self, out: &mut [i16]) -> Playout {
        let mut state = self.state.lock();

        if !state.is_primed {
            let mut filled = 0;
            let mut lowest: Option<u32> = None;
            for slot in state.slots.iter().filter(|s| s.occupied) {
                filled += 1;
                lowest = match lowest {
                    Some(low) if !seq_before(slot.sequence, low) => Some(low),
                    _ => Some(slot.sequence),
                };
            }

            match lowest {
                Some(low) if filled >= self.min_playout_delay => {
                    state.next_seq_to_play = low;
                    state.is_primed = true;
                    tracing::debug!("Jitter buffer primed at sequence {} ({} buffered)", low, filled);
                }
                _ => {
                    out.fill(0);
                    return Playout::Priming;
                }
            }
        }

        let sequence = state.next_seq_to_play;
        let index = self.index(sequence);
        let slot = &mut state.slots[index];

        let playout = if slot.occupied && slot.sequence == sequence {
            let n = out.len().min(slot.samples.len());
            out[..n].copy_from_slice(&slot.samples[..n]);
            out[n..].fill(0);
            slot.occupied = false;
            Playout::Played(sequence)
        } else {
            // An occupant older than the cursor can never play.
            if slot.occupied && seq_before(slot.sequence, sequence) {
                slot.occupied = false;
            }
            out.fill(0);
            Playout::Concealed(sequence)
        };

        match playout {
            Playout::Played(_) => state.stats.played += 1,
            _ => state.stats.concealed += 1,
        }
        state.next_seq_to_play = sequence.wrapping_add(1);
        playout
    }

    pub fn is_primed(&self) -> bool {
        self.state.lock().is_primed
    }

    pub fn next_seq_to_play(&self) -> u32 {
        self.state.lock().next_seq_to_play
    }

    /// Sequence numbers currently buffered, in slot order
    pub fn occupied_sequences(&self) -> Vec<u32> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| s.occupied)
            .map(|s| s.sequence)
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.level = state.slots.iter().filter(|s| s.occupied).count();
        stats
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;

/// Jitter buffer statistics
#[derive(Debug, Clone, Default)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub received: u64,
    pub late: u64,
    pub overwritten: u64,
    pub played: u64,
    pub concealed: u64,
}

impl JitterBufferStats {
    /// Share of playout ticks filled with silence after priming
    pub fn loss_rate(&self) -> f32 {
        let total = self.played + self.concealed;
        if total == 0 {
            0.0
        } else {
            self.concealed as f32 / total as f32
        }
    }
}
