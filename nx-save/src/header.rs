use crate::storage::Storage;
use crate::verify::{HashTableVerifier, Validity, aes_cmac};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::fmt::{Display, Formatter};
use tracing::{debug, warn};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Errors when locating and validating the save header.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(display("cannot read save header at {offset:#x}"))]
    HeaderUnreadable {
        offset: u64,
        source: std::io::Error,
    },

    #[snafu(display("neither save header copy passed the integrity check"))]
    HeaderInvalid,

    #[snafu(display(
        "save header is corrupt: {} magic is {:?}, expected {:?}",
        structure,
        String::from_utf8_lossy(&found[..]),
        String::from_utf8_lossy(&expected[..]),
    ))]
    HeaderCorrupt {
        structure: &'static str,
        expected: [u8; 4],
        found: [u8; 4],
    },
}

/// Errors when carving a sub-region out of the header.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RegionError {
    #[snafu(display("{region} at {offset:#x} (+{size:#x}) lies outside the header"))]
    OutOfBounds {
        region: &'static str,
        offset: u64,
        size: u64,
    },
}

/// Size of one header copy.
pub const HEADER_SIZE: usize = 0x4000;

/// Physical offset of the primary header copy.
pub const PRIMARY_OFFSET: u64 = 0;

/// Physical offset of the fallback header copy.
pub const FALLBACK_OFFSET: u64 = 0x4000;

/// Start of the region covered by the layout hash.
pub const HASHED_REGION_OFFSET: usize = 0x300;

/// Length of the region covered by the layout hash (one hash block).
pub const HASHED_REGION_SIZE: usize = 0x3D00;

pub const MAGIC_DISF: [u8; 4] = *b"DISF";
pub const MAGIC_DPFS: [u8; 4] = *b"DPFS";
pub const MAGIC_IVFC: [u8; 4] = *b"IVFC";
pub const MAGIC_JNGL: [u8; 4] = *b"JNGL";
pub const MAGIC_SAVE: [u8; 4] = *b"SAVE";
pub const MAGIC_RMAP: [u8; 4] = *b"RMAP";

/// The data IVFC tree always has this many levels.
pub const DATA_IVFC_LEVELS: u32 = 5;

/// The FAT IVFC tree has this many levels when present.
pub const FAT_IVFC_LEVELS: u32 = 4;

/// First layout version carrying a FAT IVFC tree.
pub const FAT_IVFC_MIN_VERSION: u32 = 0x50000;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct SaveHeaderRaw {
    cmac: [u8; 0x10],               // 0x000
    _reserved_0x010: [u8; 0xF0],    // 0x010
    layout: FsLayoutRaw,            // 0x100
    duplex: DuplexHeaderRaw,        // 0x300
    data_ivfc: IvfcHeaderRaw,       // 0x344
    _reserved_0x404: [u8; 4],       // 0x404
    journal: JournalHeaderRaw,      // 0x408
    journal_map: JournalMapRaw,     // 0x428
    _reserved_0x438: [u8; 0x1D0],   // 0x438
    save: SaveFsHeaderRaw,          // 0x608
    fat: FatHeaderRaw,              // 0x620
    main_remap: RemapHeaderRaw,     // 0x650
    meta_remap: RemapHeaderRaw,     // 0x690
    _reserved_0x6d0: [u8; 8],       // 0x6D0
    extra_data: ExtraDataRaw,       // 0x6D8
    _reserved_0x748: [u8; 0x390],   // 0x748
    fat_ivfc: IvfcHeaderRaw,        // 0xAD8
    _reserved_0xb98: [u8; 0x3468],  // 0xB98
}

/// The `DISF` filesystem layout. Offsets below are relative to 0x100.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct FsLayoutRaw {
    magic: [u8; 4],                        // 0x000
    version: U32,                          // 0x004
    hash: [u8; 0x20],                      // 0x008
    file_map_entry_offset: U64,            // 0x028
    file_map_entry_size: U64,              // 0x030
    meta_map_entry_offset: U64,            // 0x038
    meta_map_entry_size: U64,              // 0x040
    file_map_data_offset: U64,             // 0x048
    file_map_data_size: U64,               // 0x050
    duplex_l1_offset_a: U64,               // 0x058
    duplex_l1_offset_b: U64,               // 0x060
    duplex_l1_size: U64,                   // 0x068
    duplex_data_offset_a: U64,             // 0x070
    duplex_data_offset_b: U64,             // 0x078
    duplex_data_size: U64,                 // 0x080
    journal_data_offset: U64,              // 0x088
    journal_data_size_a: U64,              // 0x090
    journal_data_size_b: U64,              // 0x098
    journal_size: U64,                     // 0x0A0
    duplex_master_offset_a: U64,           // 0x0A8
    duplex_master_offset_b: U64,           // 0x0B0
    duplex_master_size: U64,               // 0x0B8
    ivfc_master_hash_offset_a: U64,        // 0x0C0
    ivfc_master_hash_offset_b: U64,        // 0x0C8
    ivfc_master_hash_size: U64,            // 0x0D0
    journal_map_table_offset: U64,         // 0x0D8
    journal_map_table_size: U64,           // 0x0E0
    journal_physical_bitmap_offset: U64,   // 0x0E8
    journal_physical_bitmap_size: U64,     // 0x0F0
    journal_virtual_bitmap_offset: U64,    // 0x0F8
    journal_virtual_bitmap_size: U64,      // 0x100
    journal_free_bitmap_offset: U64,       // 0x108
    journal_free_bitmap_size: U64,         // 0x110
    ivfc_l1_offset: U64,                   // 0x118
    ivfc_l1_size: U64,                     // 0x120
    ivfc_l2_offset: U64,                   // 0x128
    ivfc_l2_size: U64,                     // 0x130
    ivfc_l3_offset: U64,                   // 0x138
    ivfc_l3_size: U64,                     // 0x140
    fat_offset: U64,                       // 0x148
    fat_size: U64,                         // 0x150
    duplex_index: u8,                      // 0x158
    _reserved_0x159: [u8; 7],              // 0x159
    fat_ivfc_master_hash_a: U64,           // 0x160
    fat_ivfc_master_hash_b: U64,           // 0x168
    fat_ivfc_l1_offset: U64,               // 0x170
    fat_ivfc_l1_size: U64,                 // 0x178
    fat_ivfc_l2_offset: U64,               // 0x180
    fat_ivfc_l2_size: U64,                 // 0x188
    _reserved_0x190: [u8; 0x70],           // 0x190
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct DuplexHeaderRaw {
    magic: [u8; 4],                 // 0x00
    version: U32,                   // 0x04
    layers: [DuplexInfoRaw; 3],     // 0x08
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct DuplexInfoRaw {
    offset: U64,           // 0x00
    length: U64,           // 0x08
    block_size_power: U32, // 0x10
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct IvfcHeaderRaw {
    magic: [u8; 4],               // 0x00
    id: U32,                      // 0x04
    master_hash_size: U32,        // 0x08
    num_levels: U32,              // 0x0C
    levels: [IvfcLevelRaw; 6],    // 0x10
    salt_source: [u8; 0x20],      // 0xA0
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct IvfcLevelRaw {
    logical_offset: U64,   // 0x00
    hash_data_size: U64,   // 0x08
    block_size_power: U32, // 0x10
    _reserved: U32,        // 0x14
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct JournalHeaderRaw {
    magic: [u8; 4],   // 0x00
    version: U32,     // 0x04
    total_size: U64,  // 0x08
    journal_size: U64, // 0x10
    block_size: U64,  // 0x18
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct JournalMapRaw {
    version: U32,               // 0x00
    main_data_block_count: U32, // 0x04
    journal_block_count: U32,   // 0x08
    _reserved: U32,             // 0x0C
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct SaveFsHeaderRaw {
    magic: [u8; 4],   // 0x00
    version: U32,     // 0x04
    block_count: U64, // 0x08
    block_size: U64,  // 0x10
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct FatHeaderRaw {
    block_size: U64,           // 0x00
    fat_offset: U64,           // 0x08
    fat_entry_count: U32,      // 0x10
    _reserved_0x14: U32,       // 0x14
    data_offset: U64,          // 0x18
    data_block_count: U32,     // 0x20
    _reserved_0x24: U32,       // 0x24
    directory_root_block: U32, // 0x28
    file_root_block: U32,      // 0x2C
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct RemapHeaderRaw {
    magic: [u8; 4],             // 0x00
    version: U32,               // 0x04
    map_entry_count: U32,       // 0x08
    map_segment_count: U32,     // 0x0C
    segment_bits: U32,          // 0x10
    _reserved: [u8; 0x2C],      // 0x14
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct ExtraDataRaw {
    title_id: U64,              // 0x00
    user_id: [u8; 0x10],        // 0x08
    save_id: U64,               // 0x18
    save_data_type: u8,         // 0x20
    _reserved_0x21: [u8; 0x1F], // 0x21
    owner_id: U64,              // 0x40
    timestamp: U64,             // 0x48
    flags: U64,                 // 0x50
    data_size: U64,             // 0x58
    journal_size: U64,          // 0x60
    commit_id: U64,             // 0x68
}

/// Which of the two header copies was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderSlot {
    Primary,
    Fallback,
}

impl HeaderSlot {
    /// Physical offset of this copy in the container.
    #[must_use]
    pub const fn offset(self) -> u64 {
        match self {
            Self::Primary => PRIMARY_OFFSET,
            Self::Fallback => FALLBACK_OFFSET,
        }
    }
}

impl Display for HeaderSlot {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Kind of save stored in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveDataType {
    System,
    Account,
    Bcat,
    Device,
    Temporary,
    Cache,
    Unknown(u8),
}

impl From<u8> for SaveDataType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::System,
            1 => Self::Account,
            2 => Self::Bcat,
            3 => Self::Device,
            4 => Self::Temporary,
            5 => Self::Cache,
            v => Self::Unknown(v),
        }
    }
}

impl Display for SaveDataType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let name = match self {
            Self::System => "SystemSaveData",
            Self::Account => "SaveData",
            Self::Bcat => "BcatDeliveryCacheStorage",
            Self::Device => "DeviceSaveData",
            Self::Temporary => "TemporaryStorage",
            Self::Cache => "CacheStorage",
            Self::Unknown(_) => "Unknown",
        };

        f.write_str(name)
    }
}

/// Location of one duplex level's mirrors in the data remap address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplexLevelInfo {
    pub offset_a: u64,
    pub offset_b: u64,
    pub size: u64,
    pub block_size_power: u32,
}

/// Parameters of a remap table from its `RMAP` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapInfo {
    pub entry_count: u32,
    pub segment_count: u32,
    pub segment_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfcLevel {
    pub logical_offset: u64,
    pub hash_data_size: u64,
    pub block_size_power: u32,
}

/// An integrity tree description. Only the first `level_count` levels apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfcInfo {
    pub id: u32,
    pub master_hash_size: u32,
    pub level_count: u32,
    pub levels: [IvfcLevel; 6],
    pub salt_source: [u8; 0x20],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalInfo {
    pub total_size: u64,
    pub journal_size: u64,
    pub block_size: u64,
    pub main_data_block_count: u32,
    pub journal_block_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatInfo {
    pub block_size: u64,
    pub fat_offset: u64,
    pub fat_entry_count: u32,
    pub data_offset: u64,
    pub data_block_count: u32,
    pub directory_root_block: u32,
    pub file_root_block: u32,
}

/// A save header copy, owned as one buffer.
///
/// Sub-regions referenced by offset (master bitmaps and master hashes) are
/// borrowed from the same buffer.
pub struct SaveHeader {
    raw: Box<SaveHeaderRaw>,
}

impl std::fmt::Debug for SaveHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveHeader")
            .field("version", &format_args!("{:#x}", self.version()))
            .field("title_id", &format_args!("{:016x}", self.title_id()))
            .field("save_id", &format_args!("{:016x}", self.save_id()))
            .field("save_data_type", &self.save_data_type())
            .finish_non_exhaustive()
    }
}

/// The outcome of [`load()`].
#[derive(Debug)]
pub struct LoadedHeader {
    pub header: SaveHeader,
    pub slot: HeaderSlot,
    pub hash_validity: Validity,
}

/// Locates, authenticates and validates the save header.
///
/// A copy is accepted if its layout magic is `DISF`, the layout hash
/// verifies and every sub-structure magic matches. The primary copy is
/// tried first, then the fallback. If neither is accepted the result is
/// [`LoadError::HeaderCorrupt`] when a hashed copy had a bad magic and
/// [`LoadError::HeaderInvalid`] otherwise.
pub fn load<S: Storage + ?Sized>(
    storage: &S,
    verifier: &dyn HashTableVerifier,
) -> Result<LoadedHeader, LoadError> {
    let mut corrupt = None;

    for slot in [HeaderSlot::Primary, HeaderSlot::Fallback] {
        let offset = slot.offset();
        let mut buf = [0u8; HEADER_SIZE];

        storage
            .read_exact_at(offset, &mut buf)
            .context(HeaderUnreadableSnafu { offset })?;

        let header = SaveHeader::from_bytes(&buf);
        let hash_validity = header.verify_hash(verifier);

        if header.raw.layout.magic != MAGIC_DISF || hash_validity != Validity::Valid {
            warn!(
                %slot,
                offset,
                magic = ?String::from_utf8_lossy(&header.raw.layout.magic),
                %hash_validity,
                "save header copy rejected"
            );
            continue;
        }

        if let Err(e) = header.validate() {
            warn!(%slot, offset, "save header copy rejected: {e}");

            if corrupt.is_none() {
                corrupt = Some(e);
            }

            continue;
        }

        debug!(%slot, version = header.version(), "loaded save header");

        return Ok(LoadedHeader {
            header,
            slot,
            hash_validity,
        });
    }

    match corrupt {
        Some(e) => Err(e),
        None => HeaderInvalidSnafu.fail(),
    }
}

impl SaveHeader {
    /// Parses a header copy from exactly [`HEADER_SIZE`] bytes.
    pub(crate) fn from_bytes(data: &[u8; HEADER_SIZE]) -> Self {
        let raw: SaveHeaderRaw = zerocopy::transmute!(*data);

        Self { raw: Box::new(raw) }
    }

    /// Checks that every sub-structure magic matches its expected constant.
    pub fn validate(&self) -> Result<(), LoadError> {
        let raw = &self.raw;
        let checks = [
            ("layout", &raw.layout.magic, MAGIC_DISF),
            ("duplex", &raw.duplex.magic, MAGIC_DPFS),
            ("data IVFC", &raw.data_ivfc.magic, MAGIC_IVFC),
            ("journal", &raw.journal.magic, MAGIC_JNGL),
            ("save", &raw.save.magic, MAGIC_SAVE),
            ("main remap", &raw.main_remap.magic, MAGIC_RMAP),
            ("meta remap", &raw.meta_remap.magic, MAGIC_RMAP),
        ];

        for (structure, found, expected) in checks {
            ensure!(
                *found == expected,
                HeaderCorruptSnafu {
                    structure,
                    expected,
                    found: *found,
                }
            );
        }

        Ok(())
    }

    /// Runs `verifier` over the hashed region using the layout hash.
    pub fn verify_hash(&self, verifier: &dyn HashTableVerifier) -> Validity {
        verifier.verify(
            self.as_bytes(),
            &self.raw.layout.hash,
            HASHED_REGION_OFFSET,
            HASHED_REGION_SIZE,
            HASHED_REGION_SIZE,
        )
    }

    /// Computes the AES-CMAC of the layout with `key` and compares it with
    /// the embedded tag.
    pub fn verify_cmac(&self, key: &[u8; 16]) -> Validity {
        let computed = aes_cmac(key, self.raw.layout.as_bytes());

        if computed == self.raw.cmac {
            Validity::Valid
        } else {
            warn!(computed = ?computed, stored = ?self.raw.cmac, "save header CMAC mismatch");
            Validity::Invalid
        }
    }

    /// The raw header bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    fn region(&self, region: &'static str, offset: u64, size: u64) -> Result<&[u8], RegionError> {
        let bytes = self.as_bytes();
        let range = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(size).ok())
            .and_then(|(start, len)| Some(start..start.checked_add(len)?));

        range
            .and_then(|r| bytes.get(r))
            .context(OutOfBoundsSnafu {
                region,
                offset,
                size,
            })
    }

    pub fn cmac(&self) -> &[u8; 0x10] {
        &self.raw.cmac
    }

    pub fn version(&self) -> u32 {
        self.raw.layout.version.get()
    }

    /// The SHA-256 of the hashed header region.
    pub fn layout_hash(&self) -> &[u8; 0x20] {
        &self.raw.layout.hash
    }

    /// Selects master bitmap copy B when `1`, copy A otherwise.
    pub fn duplex_index(&self) -> u8 {
        self.raw.layout.duplex_index
    }

    /// The active duplex master bitmap, chosen by [`duplex_index()`](Self::duplex_index).
    pub fn duplex_master_bitmap(&self) -> Result<&[u8], RegionError> {
        let layout = &self.raw.layout;
        let offset = if layout.duplex_index == 1 {
            layout.duplex_master_offset_b.get()
        } else {
            layout.duplex_master_offset_a.get()
        };

        self.region("duplex master bitmap", offset, layout.duplex_master_size.get())
    }

    /// Both duplex master bitmap copies, A then B.
    pub fn duplex_master_bitmaps(&self) -> Result<(&[u8], &[u8]), RegionError> {
        let layout = &self.raw.layout;
        let size = layout.duplex_master_size.get();

        Ok((
            self.region("duplex master bitmap A", layout.duplex_master_offset_a.get(), size)?,
            self.region("duplex master bitmap B", layout.duplex_master_offset_b.get(), size)?,
        ))
    }

    pub fn duplex_master_size(&self) -> u64 {
        self.raw.layout.duplex_master_size.get()
    }

    /// The first duplex level, whose read-out selects data level blocks.
    pub fn duplex_level1(&self) -> DuplexLevelInfo {
        let layout = &self.raw.layout;

        DuplexLevelInfo {
            offset_a: layout.duplex_l1_offset_a.get(),
            offset_b: layout.duplex_l1_offset_b.get(),
            size: layout.duplex_l1_size.get(),
            block_size_power: self.raw.duplex.layers[1].block_size_power.get(),
        }
    }

    /// The data duplex level exposed as the container's logical store.
    pub fn duplex_data_level(&self) -> DuplexLevelInfo {
        let layout = &self.raw.layout;

        DuplexLevelInfo {
            offset_a: layout.duplex_data_offset_a.get(),
            offset_b: layout.duplex_data_offset_b.get(),
            size: layout.duplex_data_size.get(),
            block_size_power: self.raw.duplex.layers[2].block_size_power.get(),
        }
    }

    /// Physical offset of the data remap extent table.
    pub fn file_map_entry_offset(&self) -> u64 {
        self.raw.layout.file_map_entry_offset.get()
    }

    /// Physical offset of the fragmented data region.
    pub fn file_map_data_offset(&self) -> u64 {
        self.raw.layout.file_map_data_offset.get()
    }

    pub fn file_map_data_size(&self) -> u64 {
        self.raw.layout.file_map_data_size.get()
    }

    /// Physical offset of the meta remap extent table.
    pub fn meta_map_entry_offset(&self) -> u64 {
        self.raw.layout.meta_map_entry_offset.get()
    }

    pub fn main_remap(&self) -> RemapInfo {
        remap_info(&self.raw.main_remap)
    }

    pub fn meta_remap(&self) -> RemapInfo {
        remap_info(&self.raw.meta_remap)
    }

    pub fn data_ivfc(&self) -> IvfcInfo {
        let mut info = ivfc_info(&self.raw.data_ivfc);
        info.level_count = DATA_IVFC_LEVELS;
        info
    }

    /// The FAT integrity tree, present from layout version `0x50000`.
    pub fn fat_ivfc(&self) -> Option<IvfcInfo> {
        if self.version() < FAT_IVFC_MIN_VERSION {
            return None;
        }

        let mut info = ivfc_info(&self.raw.fat_ivfc);
        info.level_count = FAT_IVFC_LEVELS;
        Some(info)
    }

    pub fn data_ivfc_master_hash(&self) -> Result<&[u8], RegionError> {
        let layout = &self.raw.layout;

        self.region(
            "data IVFC master hash",
            layout.ivfc_master_hash_offset_a.get(),
            layout.ivfc_master_hash_size.get(),
        )
    }

    /// `None` when the layout version has no FAT integrity tree.
    pub fn fat_ivfc_master_hash(&self) -> Option<Result<&[u8], RegionError>> {
        let info = self.fat_ivfc()?;

        Some(self.region(
            "FAT IVFC master hash",
            self.raw.layout.fat_ivfc_master_hash_a.get(),
            u64::from(info.master_hash_size),
        ))
    }

    pub fn journal(&self) -> JournalInfo {
        let journal = &self.raw.journal;
        let map = &self.raw.journal_map;

        JournalInfo {
            total_size: journal.total_size.get(),
            journal_size: journal.journal_size.get(),
            block_size: journal.block_size.get(),
            main_data_block_count: map.main_data_block_count.get(),
            journal_block_count: map.journal_block_count.get(),
        }
    }

    pub fn fat(&self) -> FatInfo {
        let fat = &self.raw.fat;

        FatInfo {
            block_size: fat.block_size.get(),
            fat_offset: fat.fat_offset.get(),
            fat_entry_count: fat.fat_entry_count.get(),
            data_offset: fat.data_offset.get(),
            data_block_count: fat.data_block_count.get(),
            directory_root_block: fat.directory_root_block.get(),
            file_root_block: fat.file_root_block.get(),
        }
    }

    pub fn title_id(&self) -> u64 {
        self.raw.extra_data.title_id.get()
    }

    pub fn user_id(&self) -> &[u8; 0x10] {
        &self.raw.extra_data.user_id
    }

    pub fn save_id(&self) -> u64 {
        self.raw.extra_data.save_id.get()
    }

    pub fn save_data_type(&self) -> SaveDataType {
        self.raw.extra_data.save_data_type.into()
    }

    pub fn owner_id(&self) -> u64 {
        self.raw.extra_data.owner_id.get()
    }

    /// Seconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.raw.extra_data.timestamp.get()
    }

    pub fn data_size(&self) -> u64 {
        self.raw.extra_data.data_size.get()
    }

    pub fn journal_size(&self) -> u64 {
        self.raw.extra_data.journal_size.get()
    }

    pub fn commit_id(&self) -> u64 {
        self.raw.extra_data.commit_id.get()
    }
}

fn remap_info(raw: &RemapHeaderRaw) -> RemapInfo {
    RemapInfo {
        entry_count: raw.map_entry_count.get(),
        segment_count: raw.map_segment_count.get(),
        segment_bits: raw.segment_bits.get(),
    }
}

fn ivfc_info(raw: &IvfcHeaderRaw) -> IvfcInfo {
    IvfcInfo {
        id: raw.id.get(),
        master_hash_size: raw.master_hash_size.get(),
        level_count: raw.num_levels.get(),
        levels: raw.levels.each_ref().map(|level| IvfcLevel {
            logical_offset: level.logical_offset.get(),
            hash_data_size: level.hash_data_size.get(),
            block_size_power: level.block_size_power.get(),
        }),
        salt_source: raw.salt_source,
    }
}
