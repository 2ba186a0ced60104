//! Wire format
//!
//! One UDP datagram carries exactly one [`AudioPacket`]:
//!
//! ```text
//! ┌──────────────────────┬─────────────────────────────────────────┐
//! │ sequence (u32, BE)   │ N × i16 PCM samples (sender endianness) │
//! └──────────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! There is no header version and no checksum beyond UDP's own; both
//! peers must agree on N out of band.

use bytes::{Buf, BufMut, BytesMut};

use crate::constants::SAMPLE_BYTES;
use crate::error::NetworkError;

/// Size of the sequence number prefix
pub const SEQUENCE_BYTES: usize = std::mem::size_of::<u32>();

/// Datagram size for a packet holding `frames` samples
pub const fn packet_size(frames: usize) -> usize {
    SEQUENCE_BYTES + frames * SAMPLE_BYTES
}

/// One sequenced frame of mono PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence: u32,
    pub samples: Vec<i16>,
}

impl AudioPacket {
    pub fn new(sequence: u32, samples: Vec<i16>) -> Self {
        Self { sequence, samples }
    }

    /// A zeroed packet for `frames` samples, used as a reusable decode target
    pub fn silent(frames: usize) -> Self {
        Self {
            sequence: 0,
            samples: vec![0; frames],
        }
    }

    /// Encoded size in bytes
    pub fn wire_size(&self) -> usize {
        packet_size(self.samples.len())
    }

    /// Append the wire form to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_size());
        buf.put_u32(self.sequence);
        for &sample in &self.samples {
            buf.put_i16_ne(sample);
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a datagram into `self`, keeping the current sample length.
    ///
    /// The datagram must be exactly `packet_size(self.samples.len())` bytes.
    pub fn decode_into(&mut self, datagram: &[u8]) -> Result<(), NetworkError> {
        let expected = self.wire_size();
        if datagram.len() != expected {
            return Err(NetworkError::InvalidPacket {
                expected,
                actual: datagram.len(),
            });
        }

        let mut buf = datagram;
        self.sequence = buf.get_u32();
        for sample in self.samples.iter_mut() {
            *sample = buf.get_i16_ne();
        }
        Ok(())
    }

    /// Decode a datagram carrying `frames` samples
    pub fn decode(datagram: &[u8], frames: usize) -> Result<Self, NetworkError> {
        let mut packet = Self::silent(frames);
        packet.decode_into(datagram)?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sequence_is_big_endian() {
        let packet = AudioPacket::new(0x0102_0304, vec![0; 4]);
        let encoded = packet.encode();

        assert_eq!(encoded.len(), packet_size(4));
        assert_eq!(&encoded[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_samples_use_native_endianness() {
        let packet = AudioPacket::new(7, vec![-2, 300]);
        let encoded = packet.encode();

        assert_eq!(&encoded[4..6], &(-2i16).to_ne_bytes());
        assert_eq!(&encoded[6..8], &300i16.to_ne_bytes());
    }

    #[test]
    fn test_wrong_size_rejected() {
        let packet = AudioPacket::new(1, vec![5; 8]);
        let encoded = packet.encode();

        let short = AudioPacket::decode(&encoded[..encoded.len() - 1], 8);
        assert!(matches!(
            short,
            Err(NetworkError::InvalidPacket { expected: 20, actual: 19 })
        ));
        assert!(AudioPacket::decode(&encoded, 9).is_err());
        assert!(AudioPacket::decode(&[], 8).is_err());
    }

    proptest! {
        #[test]
        fn prop_packet_round_trip(sequence in any::<u32>(), samples in prop::collection::vec(any::<i16>(), 1..600)) {
            let packet = AudioPacket::new(sequence, samples);
            let decoded = AudioPacket::decode(&packet.encode(), packet.samples.len()).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
