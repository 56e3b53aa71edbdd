//! A library for reading Nintendo Switch save data containers.
//!
//! A save container multiplexes fragmented physical storage, a three-level
//! A/B replication scheme and integrity metadata into one file. This crate
//! recovers the header and rebuilds the storage translation stack so that
//! the container's logical data can be read by offset.
//!
//! # Features
//!
//! - Locate and validate the save header, with fallback to the second copy
//! - Translate sparse virtual offsets through remap extent tables
//! - Resolve the duplex cascade (master bitmap, level 1, data level)
//! - Report header fields and CMAC/hash validity without failing on them
//! - Thread-safe: every layer reads through positional I/O
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use nx_save::storage::FileStorage;
//!
//! let save = nx_save::open(FileStorage::open("save.bin")?, None)?;
//! let mut buf = [0u8; 0x200];
//!
//! save.read(0, &mut buf)?;
//! println!("{} ({})", save.header().save_data_type(), save.slot());
//! # Ok(())
//! # }
//! ```

use self::cascade::Cascade;
use self::duplex::DuplexLayer;
use self::header::{HeaderSlot, SaveHeader};
use self::remap::{RemapStorage, RemapTable};
use self::storage::Storage;
use self::verify::{HashTableVerifier, Sha256HashTable, Validity};
use snafu::{ResultExt, Snafu};
use std::sync::Arc;
use tracing::debug;

pub mod bitmap;
pub mod cascade;
pub mod duplex;
pub mod header;
pub mod remap;
pub mod storage;
pub mod verify;

/// Errors for [`open()`] and [`open_with_verifier()`].
///
/// Each variant names the stage of opening that failed.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot load save header"))]
    LoadHeaderFailed { source: header::LoadError },

    #[snafu(display("cannot open data remap storage"))]
    OpenDataRemapFailed { source: remap::OpenError },

    #[snafu(display("cannot build duplex cascade"))]
    BuildCascadeFailed { source: cascade::BuildError },

    #[snafu(display("cannot open meta remap storage"))]
    OpenMetaRemapFailed { source: remap::OpenError },
}

/// An opened save container, generic over the backing storage `S`.
///
/// Every structure is built during [`open()`] and is immutable afterwards.
/// This type is `Send + Sync`; reads may be issued from several threads.
#[must_use]
pub struct SaveData<S: Storage> {
    header: SaveHeader,
    slot: HeaderSlot,
    header_hash_validity: Validity,
    cmac_validity: Validity,
    data_remap: RemapStorage<S>,
    cascade: Cascade,
    meta_table: Arc<RemapTable>,
}

impl<S: Storage> std::fmt::Debug for SaveData<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveData")
            .field("header", &self.header)
            .field("slot", &self.slot)
            .field("header_hash_validity", &self.header_hash_validity)
            .field("cmac_validity", &self.cmac_validity)
            .field("data_layer", self.cascade.data_layer())
            .finish_non_exhaustive()
    }
}

impl<S: Storage> SaveData<S> {
    /// Fills `buf` from the container's logical store at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), duplex::ReadError> {
        self.cascade.data_layer().read(offset, buf)
    }

    /// Size of the logical store in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cascade.data_layer().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cascade.data_layer().is_empty()
    }

    /// The level 2 duplex layer backing [`read()`](Self::read).
    pub fn data_layer(&self) -> &DuplexLayer {
        self.cascade.data_layer()
    }

    pub fn cascade(&self) -> &Cascade {
        &self.cascade
    }

    /// The remap storage over the container's fragmented data region.
    pub fn data_remap(&self) -> &RemapStorage<S> {
        &self.data_remap
    }

    /// The metadata address space, remapped on top of the data layer.
    pub fn meta_storage(&self) -> RemapStorage<&DuplexLayer> {
        RemapStorage::with_table(self.cascade.data_layer(), self.meta_table.clone(), 0)
    }

    pub fn header(&self) -> &SaveHeader {
        &self.header
    }

    /// Which header copy was accepted.
    pub fn slot(&self) -> HeaderSlot {
        self.slot
    }

    pub fn header_hash_validity(&self) -> Validity {
        self.header_hash_validity
    }

    /// [`Validity::Unchecked`] when no MAC key was given to [`open()`].
    pub fn cmac_validity(&self) -> Validity {
        self.cmac_validity
    }

    /// Returns the backing storage.
    pub fn storage(&self) -> &S {
        self.data_remap.storage()
    }
}

/// Opens a save container, verifying the header hash with SHA-256.
///
/// # Arguments
///
/// * `storage` - The container bytes
/// * `mac_key` - The save MAC key, or `None` to skip the CMAC check
///
/// # Errors
///
/// Returns an [`OpenError`] naming the stage that failed. A CMAC mismatch is
/// not an error; it is reported by [`SaveData::cmac_validity()`].
pub fn open<S: Storage>(storage: S, mac_key: Option<&[u8; 16]>) -> Result<SaveData<S>, OpenError> {
    open_with_verifier(storage, mac_key, &Sha256HashTable)
}

/// Opens a save container with a caller-supplied header hash verifier.
pub fn open_with_verifier<S: Storage>(
    storage: S,
    mac_key: Option<&[u8; 16]>,
    verifier: &dyn HashTableVerifier,
) -> Result<SaveData<S>, OpenError> {
    let loaded = header::load(&storage, verifier).context(LoadHeaderFailedSnafu)?;
    let header = loaded.header;

    if loaded.slot == HeaderSlot::Fallback {
        debug!("primary save header rejected, using fallback copy");
    }

    let cmac_validity = match mac_key {
        Some(key) => header.verify_cmac(key),
        None => Validity::Unchecked,
    };

    let data_remap = RemapStorage::open(
        storage,
        header.file_map_entry_offset(),
        &header.main_remap(),
        header.file_map_data_offset(),
    )
    .context(OpenDataRemapFailedSnafu)?;

    let cascade = Cascade::build(&header, &data_remap).context(BuildCascadeFailedSnafu)?;

    let meta_table = RemapTable::read(
        data_remap.storage(),
        header.meta_map_entry_offset(),
        &header.meta_remap(),
    )
    .context(OpenMetaRemapFailedSnafu)?;

    debug!(
        slot = %loaded.slot,
        header_hash = %loaded.hash_validity,
        cmac = %cmac_validity,
        size = cascade.data_layer().len(),
        "opened save container"
    );

    Ok(SaveData {
        header,
        slot: loaded.slot,
        header_hash_validity: loaded.hash_validity,
        cmac_validity,
        data_remap,
        cascade,
        meta_table: Arc::new(meta_table),
    })
}
