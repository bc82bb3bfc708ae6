//! Fixed-size journal records.
//!
//! A record carries no magic, length, or checksum: the fixed size plus the
//! `tx_size` countdown is all recovery needs to find transaction
//! boundaries. Type tags are 1-based so an all-zero record unambiguously
//! reads as punched or never-written space, and the record size divides the
//! punch block size so zeroed regions always cover whole records.

use crate::types::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr};
use thiserror::Error;

pub const JOURNAL_ENTRY_BYTES: usize = 64;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    CreateObject = 1,
    UpdateObject = 2,
    UpdateXattr = 3,
    DeleteObject = 4,
    CreateTemporary = 5,
    UpdateTemporary = 6,
    UpdateTemporaryXattr = 7,
    DeleteTemporary = 8,
}

impl EntryType {
    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EntryType::CreateObject),
            2 => Some(EntryType::UpdateObject),
            3 => Some(EntryType::UpdateXattr),
            4 => Some(EntryType::DeleteObject),
            5 => Some(EntryType::CreateTemporary),
            6 => Some(EntryType::UpdateTemporary),
            7 => Some(EntryType::UpdateTemporaryXattr),
            8 => Some(EntryType::DeleteTemporary),
            _ => None,
        }
    }

    pub const fn targets_object(self) -> bool {
        matches!(
            self,
            EntryType::CreateObject
                | EntryType::UpdateObject
                | EntryType::UpdateXattr
                | EntryType::DeleteObject
        )
    }

    /// True for operations whose new content sits in a staging temporary.
    pub const fn carries_content(self) -> bool {
        matches!(
            self,
            EntryType::CreateObject
                | EntryType::UpdateObject
                | EntryType::CreateTemporary
                | EntryType::UpdateTemporary
        )
    }
}

/// Entity named by a journal record, selected by the entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTarget {
    Object { id: ObjectId, xattr: Xattr },
    Temporary { id: RecoveryId, xattr: TemporaryXattr },
}

/// One on-disk journal record.
///
/// `tx_size` counts the remaining records of the transaction including this
/// one, so the final record of every transaction carries `tx_size == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub ty: EntryType,
    pub tx_size: u32,
    pub staging_id: u64,
    pub target: EntryTarget,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum EntryCodecError {
    #[error("record too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown entry type tag {0}")]
    UnknownType(u8),
    #[error("unknown recovery type tag {0}")]
    UnknownRecoveryType(u8),
}

impl JournalEntry {
    pub fn encode(&self) -> [u8; JOURNAL_ENTRY_BYTES] {
        let mut bytes = [0u8; JOURNAL_ENTRY_BYTES];
        bytes[0] = self.ty.raw();
        bytes[4..8].copy_from_slice(&self.tx_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.staging_id.to_le_bytes());
        match &self.target {
            EntryTarget::Object { id, xattr } => {
                bytes[16..32].copy_from_slice(id.as_bytes());
                bytes[32..48].copy_from_slice(xattr.as_bytes());
            }
            EntryTarget::Temporary { id, xattr } => {
                bytes[16] = id.ty.raw();
                bytes[24..32].copy_from_slice(&id.id.to_le_bytes());
                bytes[32..48].copy_from_slice(xattr.as_bytes());
            }
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EntryCodecError> {
        if bytes.len() < JOURNAL_ENTRY_BYTES {
            return Err(EntryCodecError::TooShort(bytes.len()));
        }
        let ty = EntryType::from_raw(bytes[0]).ok_or(EntryCodecError::UnknownType(bytes[0]))?;
        let tx_size = u32::from_le_bytes(bytes[4..8].try_into().expect("fixed slice"));
        let staging_id = u64::from_le_bytes(bytes[8..16].try_into().expect("fixed slice"));

        let mut xattr = [0u8; 16];
        xattr.copy_from_slice(&bytes[32..48]);

        let target = if ty.targets_object() {
            let mut id = [0u8; 16];
            id.copy_from_slice(&bytes[16..32]);
            EntryTarget::Object {
                id: ObjectId::new(id),
                xattr: Xattr(xattr),
            }
        } else {
            let recovery_ty = RecoveryType::from_raw(bytes[16])
                .ok_or(EntryCodecError::UnknownRecoveryType(bytes[16]))?;
            let id = u64::from_le_bytes(bytes[24..32].try_into().expect("fixed slice"));
            EntryTarget::Temporary {
                id: RecoveryId::new(recovery_ty, id),
                xattr: TemporaryXattr(xattr),
            }
        };

        Ok(Self {
            ty,
            tx_size,
            staging_id,
            target,
        })
    }

    /// True for a record that is entirely zero: punched space or the
    /// unwritten tail of the journal file.
    pub fn is_zeroed(record: &[u8]) -> bool {
        record.iter().all(|byte| *byte == 0)
    }
}
