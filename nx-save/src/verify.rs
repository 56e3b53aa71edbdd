//! Integrity primitives consumed while opening a container.

use aes::Aes128;
use cmac::{Cmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};

/// Outcome of an integrity check that does not by itself abort opening.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Validity {
    #[default]
    Unchecked,
    Valid,
    Invalid,
}

impl Validity {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl Display for Validity {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Unchecked => f.write_str("unchecked"),
            Self::Valid => f.write_str("valid"),
            Self::Invalid => f.write_str("invalid"),
        }
    }
}

/// Checks a region of data against a table of block digests.
pub trait HashTableVerifier: Send + Sync {
    /// Verifies `source[data_offset..data_offset + data_size]`, split into
    /// `block_size` blocks, against consecutive digests in `hash_table`.
    fn verify(
        &self,
        source: &[u8],
        hash_table: &[u8],
        data_offset: usize,
        data_size: usize,
        block_size: usize,
    ) -> Validity;
}

/// A [`HashTableVerifier`] using one SHA-256 digest per block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256HashTable;

impl HashTableVerifier for Sha256HashTable {
    fn verify(
        &self,
        source: &[u8],
        hash_table: &[u8],
        data_offset: usize,
        data_size: usize,
        block_size: usize,
    ) -> Validity {
        const DIGEST_SIZE: usize = 0x20;

        let data = data_offset
            .checked_add(data_size)
            .and_then(|end| source.get(data_offset..end));

        let Some(data) = data.filter(|_| block_size != 0) else {
            return Validity::Invalid;
        };

        for (index, block) in data.chunks(block_size).enumerate() {
            let expected = index
                .checked_mul(DIGEST_SIZE)
                .and_then(|start| hash_table.get(start..start + DIGEST_SIZE));

            match expected {
                Some(expected) if Sha256::digest(block).as_slice() == expected => {}
                _ => return Validity::Invalid,
            }
        }

        Validity::Valid
    }
}

/// Computes the AES-128-CMAC of `data` under `key`.
#[must_use]
pub fn aes_cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());

    mac.update(data);
    mac.finalize().into_bytes().into()
}
