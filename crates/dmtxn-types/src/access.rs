//! Access types, lock modes and transaction outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// What a transaction does to one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccessType {
    Read = 0,
    Write = 1,
    Scan = 2,
    Insert = 3,
    Delete = 4,
}

impl AccessType {
    /// Row lock mode the access needs: reads share, everything else excludes.
    #[inline]
    pub const fn lock_mode(self) -> LockMode {
        match self {
            Self::Read => LockMode::Shared,
            Self::Write | Self::Scan | Self::Insert | Self::Delete => LockMode::Exclusive,
        }
    }

    /// Whether the access carries a write payload to persist on commit.
    #[inline]
    pub const fn writes_data(self) -> bool {
        matches!(self, Self::Write)
    }

    #[inline]
    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    pub const fn from_wire(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Scan),
            3 => Ok(Self::Insert),
            4 => Ok(Self::Delete),
            other => Err(CodecError::InvalidTag {
                what: "access type",
                tag: other,
            }),
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "RD",
            Self::Write => "WR",
            Self::Scan => "SCAN",
            Self::Insert => "INS",
            Self::Delete => "DEL",
        };
        f.write_str(name)
    }
}

/// Row lock mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum LockMode {
    #[default]
    None,
    Shared,
    Exclusive,
}

impl LockMode {
    /// Whether a request for `requested` conflicts with a lock currently held in `self`.
    #[inline]
    pub const fn conflicts(self, requested: Self) -> bool {
        match self {
            Self::None => false,
            Self::Exclusive => true,
            Self::Shared => matches!(requested, Self::Exclusive),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Shared => "SH",
            Self::Exclusive => "EX",
        };
        f.write_str(name)
    }
}

/// Terminal outcome handed to `cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Commit,
    Abort,
}

impl Outcome {
    #[inline]
    pub const fn is_commit(self) -> bool {
        matches!(self, Self::Commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_modes_per_access() {
        assert_eq!(AccessType::Read.lock_mode(), LockMode::Shared);
        for ty in [
            AccessType::Write,
            AccessType::Scan,
            AccessType::Insert,
            AccessType::Delete,
        ] {
            assert_eq!(ty.lock_mode(), LockMode::Exclusive, "{ty}");
        }
    }

    #[test]
    fn conflict_matrix() {
        use LockMode::{Exclusive as Ex, None as No, Shared as Sh};
        assert!(!No.conflicts(Sh));
        assert!(!No.conflicts(Ex));
        assert!(!Sh.conflicts(Sh));
        assert!(Sh.conflicts(Ex));
        assert!(Ex.conflicts(Sh));
        assert!(Ex.conflicts(Ex));
    }

    #[test]
    fn access_type_wire_tags() {
        for ty in [
            AccessType::Read,
            AccessType::Write,
            AccessType::Scan,
            AccessType::Insert,
            AccessType::Delete,
        ] {
            assert_eq!(AccessType::from_wire(ty.to_wire()), Ok(ty));
        }
        assert!(AccessType::from_wire(9).is_err());
    }
}
