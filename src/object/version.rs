//! Object version identifiers.
//!
//! A version is a 128-bit value compared as an integer. Ordinary versions are assigned
//! consecutively starting at [`Version::FIRST`]; six sentinels at the top of the low 64-bit
//! range express special targets for map and sync operations.

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Identifies a distributed object across the cluster.
pub type ObjectId = Uuid;

/// Identifies one attachment of an object on a peer, disambiguating multiple slaves of the
/// same object in one process.
pub type InstanceId = u32;

/// Target instance id addressing every attachment of an object.
pub const INSTANCE_ALL: InstanceId = u32::MAX;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Version(pub u128);

impl Version {
    pub const NONE: Version = Version(0);
    pub const FIRST: Version = Version(1);
    pub const NEWEST: Version = Version(0xffff_ffff_ffff_fffb);
    pub const OLDEST: Version = Version(0xffff_ffff_ffff_fffc);
    pub const NEXT: Version = Version(0xffff_ffff_ffff_fffd);
    pub const INVALID: Version = Version(0xffff_ffff_ffff_fffe);
    pub const HEAD: Version = Version(0xffff_ffff_ffff_ffff);

    /// True for ordinary, consecutively assigned versions (not `NONE`, not a sentinel).
    pub fn is_concrete(self) -> bool {
        self != Version::NONE && self.0 < Version::NEWEST.0
    }

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn low(self) -> u64 {
        self.0 as u64
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128_le(self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> Version {
        Version(buf.get_u128_le())
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Version::NONE => write!(f, "none"),
            Version::NEWEST => write!(f, "newest"),
            Version::OLDEST => write!(f, "oldest"),
            Version::NEXT => write!(f, "next"),
            Version::INVALID => write!(f, "invalid"),
            Version::HEAD => write!(f, "head"),
            Version(v) => write!(f, "{}", v),
        }
    }
}

/// An object identifier paired with a version, ordered lexicographically.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectVersion {
    pub id: ObjectId,
    pub version: Version,
}

impl ObjectVersion {
    pub fn new(id: ObjectId, version: Version) -> ObjectVersion {
        ObjectVersion { id, version }
    }
}

impl Display for ObjectVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "id {} v{}", self.id, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_order_above_ordinary_versions() {
        assert!(Version::NONE < Version::FIRST);
        assert!(Version::FIRST < Version::NEWEST);
        assert!(Version::NEWEST < Version::OLDEST);
        assert!(Version::OLDEST < Version::NEXT);
        assert!(Version::NEXT < Version::INVALID);
        assert!(Version::INVALID < Version::HEAD);
    }

    #[test]
    fn test_is_concrete() {
        assert!(!Version::NONE.is_concrete());
        assert!(Version::FIRST.is_concrete());
        assert!(Version(123_456).is_concrete());
        assert!(!Version::OLDEST.is_concrete());
        assert!(!Version::HEAD.is_concrete());
    }

    #[test]
    fn test_object_version_ordering_is_lexicographic() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        assert!(ObjectVersion::new(low, Version(9)) < ObjectVersion::new(high, Version(1)));
        assert!(ObjectVersion::new(low, Version(1)) < ObjectVersion::new(low, Version(2)));
    }

    #[test]
    fn test_version_round_trip() {
        let mut buf = Vec::new();
        Version(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10).ser(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf[0], 0x10, "little-endian encoding");
        assert_eq!(
            Version::deser(&mut &buf[..]),
            Version(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10)
        );
    }
}
