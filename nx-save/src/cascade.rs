//! Three-level duplex cascade.
//!
//! The master bitmap in the header selects level 1 blocks, the read-out of
//! level 1 is the serialized selector for the data level, and the data level
//! is the container's logical store.

use crate::bitmap::Bitmap;
use crate::duplex::{self, DuplexLayer};
use crate::header::{DuplexLevelInfo, RegionError, SaveHeader};
use crate::remap::{self, RemapStorage};
use crate::storage::{Storage, try_alloc};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

/// Errors when building a [`Cascade`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BuildError {
    #[snafu(display("cannot locate the duplex master bitmap"))]
    MasterBitmap { source: RegionError },

    #[snafu(display("cannot allocate {size:#x} bytes for {what}"))]
    AllocationFailed { what: &'static str, size: u64 },

    #[snafu(display("cannot read copy {copy} of the {level}"))]
    ReadMirrorFailed {
        level: &'static str,
        copy: char,
        source: remap::ReadError,
    },

    #[snafu(display("cannot create the {level}"))]
    CreateLayerFailed {
        level: &'static str,
        source: duplex::NewError,
    },

    #[snafu(display("cannot read out level 1"))]
    ReadLevel1Failed { source: duplex::ReadError },
}

/// The assembled cascade. Every level is owned and fully materialized.
pub struct Cascade {
    master_bitmap: Vec<u8>,
    level1: DuplexLayer,
    level2_selector: Vec<u8>,
    data_layer: DuplexLayer,
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cascade")
            .field("master_bitmap_len", &self.master_bitmap.len())
            .field("level1", &self.level1)
            .field("data_layer", &self.data_layer)
            .finish_non_exhaustive()
    }
}

impl Cascade {
    /// Reads both duplex levels through `remap` and wires their selectors.
    ///
    /// Level 1 is selected by all `8 * master_size` bits of the master bitmap
    /// and the data level by all `8 * level1_size` bits of level 1.
    pub fn build<S: Storage>(
        header: &SaveHeader,
        remap: &RemapStorage<S>,
    ) -> Result<Self, BuildError> {
        let master_bitmap = header.duplex_master_bitmap().context(MasterBitmapSnafu)?.to_vec();

        let level1 = open_level(
            remap,
            "level 1",
            &header.duplex_level1(),
            &master_bitmap,
        )?;

        let mut level2_selector = try_alloc(level1.len()).context(AllocationFailedSnafu {
            what: "the level 2 selector",
            size: level1.len(),
        })?;

        level1
            .read(0, &mut level2_selector)
            .context(ReadLevel1FailedSnafu)?;

        let data_layer = open_level(
            remap,
            "data level",
            &header.duplex_data_level(),
            &level2_selector,
        )?;

        debug!(
            master_bitmap = master_bitmap.len(),
            level1 = level1.len(),
            data = data_layer.len(),
            data_block_size = data_layer.block_size(),
            "built duplex cascade"
        );

        Ok(Self {
            master_bitmap,
            level1,
            level2_selector,
            data_layer,
        })
    }

    /// The serialized master bitmap copied out of the header.
    pub fn master_bitmap(&self) -> &[u8] {
        &self.master_bitmap
    }

    pub fn level1(&self) -> &DuplexLayer {
        &self.level1
    }

    /// Level 1 read out in full, the serialized selector of the data level.
    pub fn level2_selector(&self) -> &[u8] {
        &self.level2_selector
    }

    pub fn data_layer(&self) -> &DuplexLayer {
        &self.data_layer
    }

    /// The decoded selector of the data level.
    pub fn data_bitmap(&self) -> &Bitmap {
        self.data_layer.bitmap()
    }

    pub fn into_data_layer(self) -> DuplexLayer {
        self.data_layer
    }
}

fn open_level<S: Storage>(
    remap: &RemapStorage<S>,
    level: &'static str,
    info: &DuplexLevelInfo,
    selector: &[u8],
) -> Result<DuplexLayer, BuildError> {
    let copy_a = read_mirror(remap, level, 'A', info.offset_a, info.size)?;
    let copy_b = read_mirror(remap, level, 'B', info.offset_b, info.size)?;
    let bit_count = selector.len().saturating_mul(8);

    DuplexLayer::new(copy_a, copy_b, info.block_size_power, selector, bit_count)
        .context(CreateLayerFailedSnafu { level })
}

fn read_mirror<S: Storage>(
    remap: &RemapStorage<S>,
    level: &'static str,
    copy: char,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>, BuildError> {
    remap
        .table()
        .check_range(offset, size)
        .context(ReadMirrorFailedSnafu { level, copy })?;

    let mut buf = try_alloc(size).context(AllocationFailedSnafu { what: level, size })?;

    remap
        .read(offset, &mut buf)
        .context(ReadMirrorFailedSnafu { level, copy })?;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_SIZE;
    use crate::remap::{Extent, RemapTable};
    use crate::storage::SliceStorage;
    use std::sync::Arc;

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Level 1 mirrors at 0x00/0x08 (8 bytes, 4-byte blocks) and data mirrors
    /// at 0x10/0x30 (0x20 bytes, 8-byte blocks), identity mapped.
    fn header(master: [u8; 4]) -> SaveHeader {
        let mut buf = [0u8; HEADER_SIZE];
        let layout = 0x100;

        put_u64(&mut buf, layout + 0x058, 0x00);
        put_u64(&mut buf, layout + 0x060, 0x08);
        put_u64(&mut buf, layout + 0x068, 0x08);
        put_u64(&mut buf, layout + 0x070, 0x10);
        put_u64(&mut buf, layout + 0x078, 0x30);
        put_u64(&mut buf, layout + 0x080, 0x20);
        put_u64(&mut buf, layout + 0x0A8, 0xC00);
        put_u64(&mut buf, layout + 0x0B0, 0xC04);
        put_u64(&mut buf, layout + 0x0B8, 4);
        // DPFS layers[1] and layers[2] block size powers.
        put_u32(&mut buf, 0x300 + 0x08 + 0x14 + 0x10, 2);
        put_u32(&mut buf, 0x300 + 0x08 + 0x28 + 0x10, 3);
        buf[0xC00..0xC04].copy_from_slice(&master);

        SaveHeader::from_bytes(&buf)
    }

    fn physical() -> Vec<u8> {
        let mut data = vec![0u8; 0x50];

        // Level 1 copy A: selector word 0x50000000, data blocks 1 and 3 from B.
        data[0x00] = 0x50;
        // Level 1 copy B: all clear.
        data[0x10..0x30].fill(0xA0);
        data[0x30..0x50].fill(0xB0);
        data
    }

    fn remap(data: &[u8]) -> RemapStorage<SliceStorage<'_>> {
        let extent = Extent::new(0, 0, data.len() as u64).unwrap();
        let table = RemapTable::new(vec![extent], 0).unwrap();

        RemapStorage::with_table(SliceStorage::new(data), Arc::new(table), 0)
    }

    #[test]
    fn master_bitmap_drives_data_selection() {
        let data = physical();
        let cascade = Cascade::build(&header([0, 0, 0, 0]), &remap(&data)).unwrap();

        assert_eq!(cascade.level2_selector(), &[0x50, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(cascade.data_bitmap().len(), 64);

        let mut buf = [0u8; 0x20];
        cascade.data_layer().read(0, &mut buf).unwrap();

        for (block, chunk) in buf.chunks(8).enumerate() {
            let expected = if block % 2 == 1 { 0xB0 } else { 0xA0 };
            assert!(chunk.iter().all(|&b| b == expected), "block {block}");
        }
    }

    #[test]
    fn set_master_bit_switches_level1_copy() {
        let data = physical();
        // Bit 0 set: level 1 block 0 comes from copy B, which is all clear.
        let cascade = Cascade::build(&header([0x80, 0, 0, 0]), &remap(&data)).unwrap();

        assert_eq!(cascade.level2_selector(), &[0u8; 8]);
        assert_eq!(cascade.data_bitmap().count_ones(), 0);
    }

    #[test]
    fn oversized_mirror_is_rejected_before_allocation() {
        let data = physical();
        let mut header = header([0; 4]);
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(header.as_bytes());
        put_u64(&mut bytes, 0x100 + 0x080, 1 << 40);
        header = SaveHeader::from_bytes(&bytes);

        let err = Cascade::build(&header, &remap(&data)).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ReadMirrorFailed {
                level: "data level",
                copy: 'A',
                source: remap::ReadError::SegmentBoundaryCrossed { offset: 0x50 },
            }
        ));
    }

    #[test]
    fn unmapped_mirror_fails() {
        let data = physical();
        let short = remap(&data[..0x40]);

        let err = Cascade::build(&header([0; 4]), &short).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ReadMirrorFailed {
                level: "data level",
                copy: 'B',
                ..
            }
        ));
    }
}
