use serde::{Deserialize, Serialize};
use std::fmt;

pub const OBJECT_ID_BYTES: usize = 16;
pub const XATTR_BYTES: usize = 16;

/// Opaque 128-bit identifier for a persistent object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_BYTES]);

impl ObjectId {
    pub const fn new(bytes: [u8; OBJECT_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Category tag for temporaries that may need to be found again after an
/// unclean shutdown.
///
/// `Staging` and `Journal` are reserved for the journaling layer itself;
/// the remaining categories are for entities the caller wants to survive a
/// crash.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum RecoveryType {
    Staging = 0,
    Journal = 1,
    Checkpoint = 2,
    Backlog = 3,
}

impl RecoveryType {
    pub const ALL: [RecoveryType; 4] = [
        RecoveryType::Staging,
        RecoveryType::Journal,
        RecoveryType::Checkpoint,
        RecoveryType::Backlog,
    ];

    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RecoveryType::Staging),
            1 => Some(RecoveryType::Journal),
            2 => Some(RecoveryType::Checkpoint),
            3 => Some(RecoveryType::Backlog),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RecoveryType::Staging => "staging",
            RecoveryType::Journal => "journal",
            RecoveryType::Checkpoint => "checkpoint",
            RecoveryType::Backlog => "backlog",
        }
    }
}

/// Identity of one recoverable temporary: `(type, id)`.
///
/// Ordering is lexicographic on `(type, id)` so all temporaries of one type
/// form a contiguous range in an ordered map.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecoveryId {
    pub ty: RecoveryType,
    pub id: u64,
}

impl RecoveryId {
    pub const fn new(ty: RecoveryType, id: u64) -> Self {
        Self { ty, id }
    }
}

impl fmt::Display for RecoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ty.name(), self.id)
    }
}

impl fmt::Debug for RecoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoveryId({self})")
    }
}

/// Opaque fixed-size metadata record attached to a persistent object. The
/// journaling layer stores and returns it verbatim.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Xattr(pub [u8; XATTR_BYTES]);

impl Xattr {
    pub fn as_bytes(&self) -> &[u8; XATTR_BYTES] {
        &self.0
    }
}

impl fmt::Debug for Xattr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xattr(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Opaque fixed-size metadata record attached to a recoverable temporary.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TemporaryXattr(pub [u8; XATTR_BYTES]);

impl TemporaryXattr {
    pub fn as_bytes(&self) -> &[u8; XATTR_BYTES] {
        &self.0
    }
}

impl fmt::Debug for TemporaryXattr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TemporaryXattr(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}
