use bytes::Bytes;

/// A bitfield recording which pieces a peer has.
///
/// Bits are numbered from the high bit of the first byte. Spare bits in the
/// last byte are kept zero; a wire bitfield with spare bits set is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a full bitfield (a seed).
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Builds a bitfield from wire bytes.
    ///
    /// Returns `None` when the byte length does not match the piece count or
    /// a spare bit is set, both of which are protocol violations.
    pub fn from_wire(bytes: Bytes, piece_count: usize) -> Option<Self> {
        if bytes.len() != piece_count.div_ceil(8) {
            return None;
        }
        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        let spare = bf.bits.len() * 8 - piece_count;
        if spare > 0 {
            let last = *bf.bits.last()?;
            if last & !(0xFFu8 << spare) != 0 {
                return None;
            }
        }
        Some(bf)
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set_piece(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear_piece(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Number of pieces set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// True if `self` has any piece missing from `other`.
    pub fn has_piece_not_in(&self, other: &Bitfield) -> bool {
        (0..self.piece_count).any(|i| self.has_piece(i) && !other.has_piece(i))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
