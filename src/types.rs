//! Site identity: a 64-bit site-id partitioned into a 4-bit role tag and a
//! 60-bit ordinal (spec.md §3).

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    Mds = 0,
    Mdsl = 1,
    Client = 2,
    R2 = 3,
    Bp = 4,
    Amc = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u64);

const ROLE_SHIFT: u32 = 60;
const ORDINAL_MASK: u64 = (1 << ROLE_SHIFT) - 1;

impl SiteId {
    pub fn new(role: Role, ordinal: u64) -> Self {
        assert!(ordinal <= ORDINAL_MASK, "ordinal overflows 60 bits");
        SiteId(((role as u64) << ROLE_SHIFT) | ordinal)
    }

    pub fn role(self) -> Role {
        Role::try_from((self.0 >> ROLE_SHIFT) as u8).expect("valid role tag")
    }

    pub fn ordinal(self) -> u64 {
        self.0 & ORDINAL_MASK
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.role(), self.ordinal())
    }
}

/// Directory uuid; opaque 64-bit identifier allocated by R2/MDSL (`mi_uuid`).
pub type Uuid64 = u64;
pub type Fsid = u64;
pub type Txg = u64;
pub type ItbId = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_and_ordinal_round_trip() {
        let s = SiteId::new(Role::Mds, 1234);
        assert_eq!(s.role(), Role::Mds);
        assert_eq!(s.ordinal(), 1234);
    }
}
