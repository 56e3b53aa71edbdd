use crate::bitmap::{Bitmap, BitmapError};
use crate::storage::Storage;
use snafu::{ResultExt, Snafu, ensure};
use std::cmp::min;
use std::io;

/// Errors when constructing a [`DuplexLayer`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum NewError {
    #[snafu(display("mirror copies differ in size ({a_len:#x} vs {b_len:#x})"))]
    MismatchedCopies { a_len: usize, b_len: usize },

    #[snafu(display("invalid block size power {power}"))]
    InvalidBlockSize { power: u32 },

    #[snafu(display("cannot decode the block selector"))]
    DecodeSelectorFailed { source: BitmapError },
}

/// Errors when reading a [`DuplexLayer`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("range {offset:#x}+{len:#x} is outside the {size:#x}-byte layer"))]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[snafu(display("block #{block} has no selector bit"))]
    MissingSelector { block: u64, source: BitmapError },
}

/// Two mirrored copies of the same data plus one selector bit per block.
///
/// A clear bit makes copy A authoritative for that block, a set bit copy B.
/// Both copies are addressed by the same logical offset.
pub struct DuplexLayer {
    copy_a: Vec<u8>,
    copy_b: Vec<u8>,
    block_size_power: u32,
    bitmap: Bitmap,
}

impl std::fmt::Debug for DuplexLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexLayer")
            .field("len", &self.copy_a.len())
            .field("block_size", &self.block_size())
            .field("bitmap", &self.bitmap)
            .finish()
    }
}

impl DuplexLayer {
    /// Builds a layer from its mirrors and a serialized selector of
    /// `bit_count` bits (see [`Bitmap::decode_into()`]).
    pub fn new(
        copy_a: Vec<u8>,
        copy_b: Vec<u8>,
        block_size_power: u32,
        selector: &[u8],
        bit_count: usize,
    ) -> Result<Self, NewError> {
        ensure!(
            copy_a.len() == copy_b.len(),
            MismatchedCopiesSnafu {
                a_len: copy_a.len(),
                b_len: copy_b.len()
            }
        );

        ensure!(
            block_size_power < 32,
            InvalidBlockSizeSnafu {
                power: block_size_power
            }
        );

        let bitmap =
            Bitmap::from_serialized(selector, bit_count).context(DecodeSelectorFailedSnafu)?;

        Ok(Self {
            copy_a,
            copy_b,
            block_size_power,
            bitmap,
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.copy_a.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.copy_a.is_empty()
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        1 << self.block_size_power
    }

    /// The decoded per-block selector.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn copy_a(&self) -> &[u8] {
        &self.copy_a
    }

    pub fn copy_b(&self) -> &[u8] {
        &self.copy_b
    }

    /// Fills `buf` from `offset`, taking each block from its selected copy.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let size = self.len();

        ensure!(
            offset
                .checked_add(buf.len() as u64)
                .is_some_and(|end| end <= size),
            OutOfBoundsSnafu {
                offset,
                len: buf.len(),
                size
            }
        );

        let block_size = self.block_size();
        let mut pos = offset;
        let mut copied = 0;

        while copied < buf.len() {
            let block = pos >> self.block_size_power;
            let in_block = pos & (block_size - 1);
            let n = min(block_size - in_block, (buf.len() - copied) as u64) as usize;

            let use_b = self
                .bitmap
                .test(block as usize)
                .context(MissingSelectorSnafu { block })?;
            let src = if use_b { &self.copy_b } else { &self.copy_a };
            let start = pos as usize;

            buf[copied..copied + n].copy_from_slice(&src[start..start + n]);

            copied += n;
            pos += n as u64;
        }

        Ok(())
    }
}

impl Storage for DuplexLayer {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.len();

        if offset >= size {
            return Ok(0);
        }

        let n = min(buf.len() as u64, size - offset) as usize;

        self.read(offset, &mut buf[..n]).map_err(io::Error::other)?;

        Ok(n)
    }

    fn len(&self) -> u64 {
        DuplexLayer::len(self)
    }
}
