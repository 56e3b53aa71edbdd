//! Bit vectors selecting the active copy of each duplex block.
//!
//! At runtime bits are stored least-significant-first within each byte. On
//! disk a selector is a sequence of big-endian 32-bit words whose bits are
//! consumed most-significant-first, so decoding transposes the order.

use snafu::{OptionExt, Snafu, ensure};

/// Errors for [`Bitmap`] operations.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BitmapError {
    #[snafu(display("bit #{bit} is out of range for a {len}-bit bitmap"))]
    OutOfRange { bit: usize, len: usize },

    #[snafu(display("serialized bitmap holds {available} bits but {required} are required"))]
    SourceTooShort { required: usize, available: usize },

    #[snafu(display("cannot allocate a {bits}-bit bitmap"))]
    AllocationFailed { bits: usize },
}

/// An owned bit vector, LSB-first within each byte.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
    len: usize,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("ones", &self.count_ones())
            .finish_non_exhaustive()
    }
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn with_len(len: usize) -> Result<Self, BitmapError> {
        let byte_len = len.div_ceil(8);
        let bytes = crate::storage::try_alloc(byte_len as u64)
            .context(AllocationFailedSnafu { bits: len })?;

        Ok(Self { bytes, len })
    }

    /// Decodes `bit_count` bits from their serialized form into a new bitmap.
    ///
    /// See [`decode_into()`](Self::decode_into) for the source format.
    pub fn from_serialized(src: &[u8], bit_count: usize) -> Result<Self, BitmapError> {
        let mut bitmap = Self::with_len(bit_count)?;

        bitmap.decode_into(src, bit_count)?;

        Ok(bitmap)
    }

    /// Number of bits in the bitmap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the runtime (LSB-first) representation.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn set(&mut self, bit: usize) -> Result<(), BitmapError> {
        let (byte, mask) = self.locate(bit)?;
        self.bytes[byte] |= mask;
        Ok(())
    }

    pub fn clear(&mut self, bit: usize) -> Result<(), BitmapError> {
        let (byte, mask) = self.locate(bit)?;
        self.bytes[byte] &= !mask;
        Ok(())
    }

    /// Returns `true` if `bit` is set.
    pub fn test(&self, bit: usize) -> Result<bool, BitmapError> {
        let (byte, mask) = self.locate(bit)?;
        Ok(self.bytes[byte] & mask != 0)
    }

    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Decodes `bit_count` serialized bits from `src` into bits
    /// `0..bit_count` of this bitmap.
    ///
    /// `src` is read as consecutive big-endian 32-bit words, each word
    /// contributing its bits from most to least significant. A trailing
    /// partial word contributes only the high bits that are still needed.
    pub fn decode_into(&mut self, src: &[u8], bit_count: usize) -> Result<(), BitmapError> {
        if bit_count == 0 {
            return Ok(());
        }

        ensure!(
            bit_count <= self.len,
            OutOfRangeSnafu {
                bit: bit_count - 1,
                len: self.len
            }
        );

        ensure!(
            src.len().saturating_mul(8) >= bit_count,
            SourceTooShortSnafu {
                required: bit_count,
                available: src.len().saturating_mul(8),
            }
        );

        let mut bit = 0;

        for chunk in src.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);

            let mut value = u32::from_be_bytes(word);
            let end = bit_count.min(bit + 32);

            while bit < end {
                if value & 0x8000_0000 != 0 {
                    self.set(bit)?;
                } else {
                    self.clear(bit)?;
                }

                value <<= 1;
                bit += 1;
            }

            if bit == bit_count {
                break;
            }
        }

        Ok(())
    }

    fn locate(&self, bit: usize) -> Result<(usize, u8), BitmapError> {
        ensure!(bit < self.len, OutOfRangeSnafu { bit, len: self.len });
        Ok((bit >> 3, 1 << (bit & 7)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_test_are_lsb_first() {
        let mut bitmap = Bitmap::with_len(16).unwrap();

        bitmap.set(0).unwrap();
        bitmap.set(9).unwrap();
        assert_eq!(bitmap.as_bytes(), &[0x01, 0x02]);

        assert!(bitmap.test(9).unwrap());
        bitmap.clear(9).unwrap();
        assert!(!bitmap.test(9).unwrap());
        assert_eq!(bitmap.as_bytes(), &[0x01, 0x00]);
    }

    #[test]
    fn out_of_range_bit_is_rejected() {
        let mut bitmap = Bitmap::with_len(10).unwrap();

        assert!(matches!(
            bitmap.set(10),
            Err(BitmapError::OutOfRange { bit: 10, len: 10 })
        ));
        assert!(bitmap.test(12).is_err());
    }

    #[test]
    fn decode_high_bit_of_first_word_is_bit_zero() {
        let bitmap = Bitmap::from_serialized(&[0x80, 0x00, 0x00, 0x00], 32).unwrap();

        assert!(bitmap.test(0).unwrap());
        assert!((1..32).all(|bit| !bitmap.test(bit).unwrap()));
        assert_eq!(bitmap.as_bytes(), &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn decode_low_bit_of_word_is_bit_thirty_one() {
        let bitmap = Bitmap::from_serialized(&[0x00, 0x00, 0x00, 0x01], 32).unwrap();

        assert_eq!(bitmap.count_ones(), 1);
        assert!(bitmap.test(31).unwrap());
        assert_eq!(bitmap.as_bytes(), &[0x00, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn decode_spans_words() {
        let src = [0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00];
        let bitmap = Bitmap::from_serialized(&src, 64).unwrap();

        assert_eq!(bitmap.count_ones(), 1);
        assert!(bitmap.test(33).unwrap());
    }

    #[test]
    fn decode_partial_word_uses_high_bits_only() {
        // Only the top three bits of 0xE1 are consumed.
        let bitmap = Bitmap::from_serialized(&[0xE1], 3).unwrap();

        assert_eq!(bitmap.len(), 3);
        assert_eq!(bitmap.count_ones(), 3);
    }

    #[test]
    fn decode_overwrites_previous_bits() {
        let mut bitmap = Bitmap::with_len(8).unwrap();

        bitmap.decode_into(&[0xFF], 8).unwrap();
        bitmap.decode_into(&[0x0F], 8).unwrap();
        bitmap.decode_into(&[0x0F], 8).unwrap();

        assert_eq!(bitmap.as_bytes(), &[0xF0]);
    }

    #[test]
    fn decode_rejects_short_source() {
        let err = Bitmap::from_serialized(&[0xFF], 9).unwrap_err();

        assert!(matches!(
            err,
            BitmapError::SourceTooShort {
                required: 9,
                available: 8
            }
        ));
    }
}
