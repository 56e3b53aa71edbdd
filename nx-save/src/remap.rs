//! Sparse virtual address spaces over fragmented physical storage.
//!
//! A remap table is an ascending list of [`Extent`]s read from the container.
//! Runs of virtually contiguous extents form [`Segment`]s, and the top
//! `segment_bits` bits of a virtual offset index the segment directly.

use crate::header::RemapInfo;
use crate::storage::{Storage, try_alloc};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::cmp::min;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of one on-disk extent table entry.
pub const ENTRY_SIZE: usize = 0x20;

/// Errors when building a [`RemapTable`] or opening a [`RemapStorage`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("segment bits {bits} exceed the 64-bit address width"))]
    InvalidSegmentBits { bits: u32 },

    #[snafu(display(
        "extent table at {offset:#x} (+{size:#x}) lies outside the {len:#x}-byte storage"
    ))]
    TableOutOfRange { offset: u64, size: u64, len: u64 },

    #[snafu(display("cannot allocate the table for {count} extents"))]
    AllocationFailed { count: u32 },

    #[snafu(display("cannot read extent table at {offset:#x}"))]
    ReadEntriesFailed {
        offset: u64,
        source: std::io::Error,
    },

    #[snafu(display("extent #{index} is malformed"))]
    MalformedExtent { index: usize },

    #[snafu(display("extent #{index} overlaps or precedes its predecessor"))]
    UnorderedExtent { index: usize },
}

/// Errors when reading through a [`RemapStorage`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("virtual offset {offset:#x} is not mapped"))]
    OffsetOutOfRange { offset: u64 },

    #[snafu(display("read reaches {offset:#x}, past the end of its segment"))]
    SegmentBoundaryCrossed { offset: u64 },

    #[snafu(display("physical offset for virtual offset {offset:#x} overflows"))]
    PhysicalOffsetOverflow { offset: u64 },

    #[snafu(display("cannot read virtual offset {offset:#x} (physical {physical:#x})"))]
    ReadFailed {
        offset: u64,
        physical: u64,
        source: std::io::Error,
    },
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct ExtentRaw {
    virtual_offset: U64,  // 0x00
    physical_offset: U64, // 0x08
    size: U64,            // 0x10
    alignment: U32,       // 0x18
    _reserved: U32,       // 0x1C
}

/// One contiguous run of bytes mapped from a virtual to a physical range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    virtual_offset: u64,
    virtual_offset_end: u64,
    physical_offset: u64,
    physical_offset_end: u64,
    size: u64,
    alignment: u32,
    /// Index of the owning segment, assigned when the table is built.
    segment: usize,
}

impl Extent {
    /// Returns `None` if either range would overflow the address space.
    #[must_use]
    pub fn new(virtual_offset: u64, physical_offset: u64, size: u64) -> Option<Self> {
        Some(Self {
            virtual_offset,
            virtual_offset_end: virtual_offset.checked_add(size)?,
            physical_offset,
            physical_offset_end: physical_offset.checked_add(size)?,
            size,
            alignment: 0,
            segment: 0,
        })
    }

    fn from_raw(raw: &ExtentRaw) -> Option<Self> {
        let mut extent = Self::new(
            raw.virtual_offset.get(),
            raw.physical_offset.get(),
            raw.size.get(),
        )?;

        extent.alignment = raw.alignment.get();

        Some(extent)
    }

    pub fn virtual_offset(&self) -> u64 {
        self.virtual_offset
    }

    /// Exclusive end of the virtual range.
    pub fn virtual_offset_end(&self) -> u64 {
        self.virtual_offset_end
    }

    pub fn physical_offset(&self) -> u64 {
        self.physical_offset
    }

    pub fn physical_offset_end(&self) -> u64 {
        self.physical_offset_end
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Index of the [`Segment`] this extent belongs to.
    pub fn segment(&self) -> usize {
        self.segment
    }

    fn contains(&self, offset: u64) -> bool {
        self.virtual_offset <= offset && offset < self.virtual_offset_end
    }
}

/// A maximal run of virtually contiguous extents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    base_virtual_offset: u64,
    length: u64,
    /// Member extents as a range into [`RemapTable::extents()`].
    extents: Range<usize>,
}

impl Segment {
    pub fn base_virtual_offset(&self) -> u64 {
        self.base_virtual_offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn extent_range(&self) -> Range<usize> {
        self.extents.clone()
    }

    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }
}

/// An extent list partitioned into segments.
///
/// All extents live in one contiguous arena; segments hold index ranges into
/// it and the extent following `i` in the same segment is `i + 1`.
#[derive(Debug, Clone)]
pub struct RemapTable {
    segment_bits: u32,
    extents: Vec<Extent>,
    segments: Vec<Segment>,
}

impl RemapTable {
    /// Builds a table from extents in ascending, non-overlapping virtual order.
    pub fn new(mut extents: Vec<Extent>, segment_bits: u32) -> Result<Self, OpenError> {
        ensure!(
            segment_bits <= 64,
            InvalidSegmentBitsSnafu { bits: segment_bits }
        );

        for (index, pair) in extents.windows(2).enumerate() {
            ensure!(
                pair[1].virtual_offset >= pair[0].virtual_offset_end,
                UnorderedExtentSnafu { index: index + 1 }
            );
        }

        let segments = build_segments(&mut extents);

        Ok(Self {
            segment_bits,
            extents,
            segments,
        })
    }

    /// Reads `info.entry_count` extents from `storage` at `entry_offset`.
    pub fn read<S: Storage + ?Sized>(
        storage: &S,
        entry_offset: u64,
        info: &RemapInfo,
    ) -> Result<Self, OpenError> {
        let count = info.entry_count;
        let size = u64::from(count) * ENTRY_SIZE as u64;
        let len = storage.len();

        ensure!(
            entry_offset.checked_add(size).is_some_and(|end| end <= len),
            TableOutOfRangeSnafu {
                offset: entry_offset,
                size,
                len
            }
        );

        let mut buf = try_alloc(size)
            .context(AllocationFailedSnafu { count })?;

        storage
            .read_exact_at(entry_offset, &mut buf)
            .context(ReadEntriesFailedSnafu {
                offset: entry_offset,
            })?;

        let mut extents = Vec::new();

        extents
            .try_reserve_exact(count as usize)
            .ok()
            .context(AllocationFailedSnafu { count })?;

        for (index, chunk) in buf.chunks_exact(ENTRY_SIZE).enumerate() {
            let raw = ExtentRaw::ref_from_bytes(chunk)
                .map_err(|_| MalformedExtentSnafu { index }.build())?;
            let extent = Extent::from_raw(raw).context(MalformedExtentSnafu { index })?;

            extents.push(extent);
        }

        let table = Self::new(extents, info.segment_bits)?;

        if table.segments.len() != info.segment_count as usize {
            warn!(
                declared = info.segment_count,
                built = table.segments.len(),
                "remap segment count disagrees with header"
            );
        }

        debug!(
            extents = table.extents.len(),
            segments = table.segments.len(),
            segment_bits = table.segment_bits,
            "loaded remap table"
        );

        Ok(table)
    }

    pub fn segment_bits(&self) -> u32 {
        self.segment_bits
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the member extents of segment `index`.
    pub fn segment_extents(&self, index: usize) -> Option<&[Extent]> {
        let segment = self.segments.get(index)?;
        Some(&self.extents[segment.extents.clone()])
    }

    /// Returns the extent containing `offset`.
    pub fn locate(&self, offset: u64) -> Result<&Extent, ReadError> {
        let index = self.locate_index(offset)?;
        Ok(&self.extents[index])
    }

    /// Checks that `len` bytes from `offset` are mapped by a single segment,
    /// so that a read of that range cannot fail on translation.
    pub fn check_range(&self, offset: u64, len: u64) -> Result<(), ReadError> {
        if len == 0 {
            return Ok(());
        }

        let extent = self.locate(offset)?;
        let segment = &self.segments[extent.segment];
        let end = segment.base_virtual_offset + segment.length;

        ensure!(
            offset.checked_add(len).is_some_and(|e| e <= end),
            SegmentBoundaryCrossedSnafu { offset: end }
        );

        Ok(())
    }

    fn segment_index(&self, offset: u64) -> usize {
        // A shift by 64 leaves no index bits: everything is segment 0.
        offset.checked_shr(64 - self.segment_bits).unwrap_or(0) as usize
    }

    fn locate_index(&self, offset: u64) -> Result<usize, ReadError> {
        let segment = self
            .segments
            .get(self.segment_index(offset))
            .context(OffsetOutOfRangeSnafu { offset })?;

        // Ascending order means the first extent ending past `offset` is the
        // only candidate.
        segment
            .extents
            .clone()
            .find(|&i| self.extents[i].virtual_offset_end > offset)
            .filter(|&i| self.extents[i].contains(offset))
            .context(OffsetOutOfRangeSnafu { offset })
    }

    /// Returns the extent after `index` in the same segment.
    fn next_in_segment(&self, index: usize) -> Option<usize> {
        let segment = &self.segments[self.extents[index].segment];
        let next = index + 1;

        segment.extents.contains(&next).then_some(next)
    }
}

fn build_segments(extents: &mut [Extent]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut start = 0;

    for end in 1..=extents.len() {
        let contiguous =
            end < extents.len() && extents[end - 1].virtual_offset_end == extents[end].virtual_offset;

        if contiguous {
            continue;
        }

        let index = segments.len();

        for extent in &mut extents[start..end] {
            extent.segment = index;
        }

        segments.push(Segment {
            base_virtual_offset: extents[start].virtual_offset,
            length: extents[end - 1].virtual_offset_end - extents[start].virtual_offset,
            extents: start..end,
        });

        start = end;
    }

    segments
}

/// A sparse virtual address space over a backing [`Storage`].
///
/// Physical positions are `base_offset + extent.physical_offset + delta`.
pub struct RemapStorage<S: Storage> {
    storage: S,
    table: Arc<RemapTable>,
    base_offset: u64,
}

impl<S: Storage> std::fmt::Debug for RemapStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemapStorage")
            .field("base_offset", &self.base_offset)
            .field("extents", &self.table.extents.len())
            .field("segments", &self.table.segments.len())
            .finish_non_exhaustive()
    }
}

impl<S: Storage> RemapStorage<S> {
    /// Reads the extent table from `storage` itself and maps reads into it.
    pub fn open(
        storage: S,
        entry_offset: u64,
        info: &RemapInfo,
        base_offset: u64,
    ) -> Result<Self, OpenError> {
        let table = RemapTable::read(&storage, entry_offset, info)?;

        Ok(Self::with_table(storage, Arc::new(table), base_offset))
    }

    pub fn with_table(storage: S, table: Arc<RemapTable>, base_offset: u64) -> Self {
        Self {
            storage,
            table,
            base_offset,
        }
    }

    pub fn table(&self) -> &RemapTable {
        &self.table
    }

    /// Returns the backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Fills `buf` from virtual offset `offset`.
    ///
    /// The read may cross extent boundaries within one segment; reaching the
    /// end of a segment before `buf` is full fails with
    /// [`ReadError::SegmentBoundaryCrossed`].
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        if buf.is_empty() {
            return Ok(());
        }

        let table = &self.table;
        let mut index = table.locate_index(offset)?;
        let mut pos = offset;
        let mut copied = 0;

        loop {
            let extent = &table.extents[index];
            let delta = pos - extent.virtual_offset;
            let n = min(extent.virtual_offset_end - pos, (buf.len() - copied) as u64) as usize;

            let physical = self
                .base_offset
                .checked_add(extent.physical_offset)
                .and_then(|p| p.checked_add(delta))
                .context(PhysicalOffsetOverflowSnafu { offset: pos })?;

            self.storage
                .read_exact_at(physical, &mut buf[copied..copied + n])
                .context(ReadFailedSnafu {
                    offset: pos,
                    physical,
                })?;

            copied += n;
            pos += n as u64;

            if copied == buf.len() {
                return Ok(());
            }

            index = table
                .next_in_segment(index)
                .context(SegmentBoundaryCrossedSnafu { offset: pos })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SliceStorage;
    use proptest::prelude::*;

    const SEG1: u64 = 1 << 62;

    fn extent(virtual_offset: u64, physical_offset: u64, size: u64) -> Extent {
        Extent::new(virtual_offset, physical_offset, size).unwrap()
    }

    /// Two segments: [0, 0x30) in two extents and [SEG1, SEG1 + 0x20).
    fn sample_table() -> RemapTable {
        RemapTable::new(
            vec![
                extent(0x00, 0x40, 0x10),
                extent(0x10, 0x00, 0x20),
                extent(SEG1, 0x20, 0x20),
            ],
            2,
        )
        .unwrap()
    }

    fn physical_pattern() -> Vec<u8> {
        (0..0x60u8).collect()
    }

    #[test]
    fn contiguous_extents_share_a_segment() {
        let table = sample_table();

        assert_eq!(table.segments().len(), 2);
        assert_eq!(table.segments()[0].extent_range(), 0..2);
        assert_eq!(table.segments()[0].length(), 0x30);
        assert_eq!(table.segments()[1].base_virtual_offset(), SEG1);
        assert_eq!(table.segment_extents(0).unwrap().len(), 2);
        assert_eq!(table.extents()[2].segment(), 1);
    }

    #[test]
    fn locate_uses_top_bits() {
        let table = sample_table();

        assert_eq!(table.locate(0x0F).unwrap().physical_offset(), 0x40);
        assert_eq!(table.locate(0x10).unwrap().physical_offset(), 0x00);
        assert_eq!(table.locate(SEG1 + 5).unwrap().physical_offset(), 0x20);
    }

    #[test]
    fn locate_misses_are_out_of_range() {
        let table = sample_table();

        for offset in [0x30, SEG1 + 0x20, 2 << 62, u64::MAX] {
            assert!(matches!(
                table.locate(offset),
                Err(ReadError::OffsetOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn read_walks_merged_extents() {
        let data = physical_pattern();
        let storage = RemapStorage::with_table(SliceStorage::new(&data), Arc::new(sample_table()), 0);
        let mut buf = [0u8; 0x18];

        storage.read(0x08, &mut buf).unwrap();

        let expected: Vec<u8> = (0x48..0x50).chain(0x00..0x10).collect();
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn read_applies_base_offset() {
        let mut data = vec![0xFFu8; 0x10];
        data.extend(physical_pattern());
        let storage =
            RemapStorage::with_table(SliceStorage::new(&data), Arc::new(sample_table()), 0x10);
        let mut buf = [0u8; 4];

        storage.read(SEG1, &mut buf).unwrap();
        assert_eq!(buf, [0x20, 0x21, 0x22, 0x23]);
    }

    #[test]
    fn read_past_segment_end_fails() {
        let data = physical_pattern();
        let storage = RemapStorage::with_table(SliceStorage::new(&data), Arc::new(sample_table()), 0);
        let mut buf = [0u8; 0x10];

        let err = storage.read(0x28, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            ReadError::SegmentBoundaryCrossed { offset: 0x30 }
        ));
    }

    #[test]
    fn overlapping_extents_are_rejected() {
        let err = RemapTable::new(vec![extent(0, 0, 0x10), extent(0x08, 0x10, 0x10)], 0)
            .unwrap_err();

        assert!(matches!(err, OpenError::UnorderedExtent { index: 1 }));
        assert!(matches!(
            RemapTable::new(Vec::new(), 65),
            Err(OpenError::InvalidSegmentBits { bits: 65 })
        ));
    }

    #[test]
    fn read_parses_entry_table() {
        let mut data = Vec::new();

        for (v, p, s) in [(0u64, 0x100u64, 0x10u64), (0x10, 0x200, 0x10)] {
            data.extend_from_slice(&v.to_le_bytes());
            data.extend_from_slice(&p.to_le_bytes());
            data.extend_from_slice(&s.to_le_bytes());
            data.extend_from_slice(&[0u8; 8]);
        }

        let info = RemapInfo {
            entry_count: 2,
            segment_count: 1,
            segment_bits: 1,
        };
        let table = RemapTable::read(&SliceStorage::new(&data), 0, &info).unwrap();

        assert_eq!(table.segments().len(), 1);
        assert_eq!(table.locate(0x18).unwrap().physical_offset(), 0x200);
    }

    #[test]
    fn check_range_stays_within_segment() {
        let table = sample_table();

        assert!(table.check_range(0x08, 0x28).is_ok());
        assert!(table.check_range(0x30, 0).is_ok());
        assert!(matches!(
            table.check_range(0x08, 0x29),
            Err(ReadError::SegmentBoundaryCrossed { offset: 0x30 })
        ));
        assert!(matches!(
            table.check_range(SEG1, u64::MAX),
            Err(ReadError::SegmentBoundaryCrossed { .. })
        ));
        assert!(matches!(
            table.check_range(0x30, 1),
            Err(ReadError::OffsetOutOfRange { offset: 0x30 })
        ));
    }

    #[test]
    fn oversized_entry_table_is_rejected_before_allocation() {
        let data = [0u8; 0x40];
        let info = RemapInfo {
            entry_count: u32::MAX,
            segment_count: 1,
            segment_bits: 1,
        };

        assert!(matches!(
            RemapTable::read(&SliceStorage::new(&data), 0x20, &info),
            Err(OpenError::TableOutOfRange {
                offset: 0x20,
                len: 0x40,
                ..
            })
        ));
    }

    /// Ascending, non-overlapping extents from (gap, size) pairs.
    fn extents_from(layout: &[(u64, u64)]) -> Vec<Extent> {
        let mut pos = 0;
        let mut physical = 0;

        layout
            .iter()
            .map(|&(gap, size)| {
                let e = extent(pos + gap, physical, size);
                pos += gap + size;
                physical += size;
                e
            })
            .collect()
    }

    proptest! {
        #[test]
        fn segments_partition_extents(
            layout in prop::collection::vec((prop_oneof![Just(0u64), 1u64..16], 1u64..64), 0..32)
        ) {
            let extents = extents_from(&layout);
            let table = RemapTable::new(extents.clone(), 0).unwrap();

            let mut next = 0;
            for (index, segment) in table.segments().iter().enumerate() {
                let range = segment.extent_range();
                prop_assert_eq!(range.start, next);
                prop_assert!(!range.is_empty());
                next = range.end;

                let members = table.segment_extents(index).unwrap();
                prop_assert_eq!(segment.base_virtual_offset(), members[0].virtual_offset());
                prop_assert_eq!(
                    segment.length(),
                    members[members.len() - 1].virtual_offset_end() - segment.base_virtual_offset()
                );
                for pair in members.windows(2) {
                    prop_assert_eq!(pair[0].virtual_offset_end(), pair[1].virtual_offset());
                }
                for member in members {
                    prop_assert_eq!(member.segment(), index);
                }
            }
            prop_assert_eq!(next, extents.len());

            for (built, original) in table.extents().iter().zip(&extents) {
                prop_assert_eq!(built.virtual_offset(), original.virtual_offset());
                prop_assert_eq!(built.size(), original.size());
            }
        }

        #[test]
        fn locate_finds_containing_extent(
            sizes in prop::collection::vec(1u64..64, 1..32),
            probe in any::<prop::sample::Index>(),
        ) {
            let layout: Vec<_> = sizes.iter().map(|&s| (0, s)).collect();
            let extents = extents_from(&layout);
            let end = extents[extents.len() - 1].virtual_offset_end();
            let table = RemapTable::new(extents.clone(), 0).unwrap();

            let offset = probe.index(end as usize) as u64;
            let found = table.locate(offset).unwrap();
            let expected = extents.iter().find(|e| e.contains(offset)).unwrap();
            prop_assert_eq!(found.virtual_offset(), expected.virtual_offset());

            prop_assert!(table.locate(end).is_err());
        }
    }
}
