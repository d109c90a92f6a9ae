//! ITE (index table entry) and mdu: the packed per-name records an ITB
//! actually carries (spec.md §3 "ITB: a packed ITE array", §4.4 hit path
//! returns "an mdu or link_source"). Encoded with `bincode` behind a 4-byte
//! length prefix, the same convention `wire::push_section` uses for framed
//! sections.

use crate::error::Error;
use crate::types::Uuid64;
use serde::{Deserialize, Serialize};

/// What a name resolves to (spec.md §3's "mdu or link_source").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IteTarget {
    File { mdu: Mdu },
    Dir { mdu: Mdu },
    Link { source: Uuid64 },
}

/// Metadata union: the fixed per-entry stat fields spec.md §3 groups under
/// "mdu", independent of what kind of entry it is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mdu {
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: i64,
    pub mtime: i64,
}

impl Mdu {
    pub fn new_file() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            mode: 0o100_644,
            size: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            ctime: now,
            mtime: now,
        }
    }

    pub fn new_dir() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            mode: 0o040_755,
            size: 0,
            nlink: 2,
            uid: 0,
            gid: 0,
            ctime: now,
            mtime: now,
        }
    }
}

/// One packed name -> target record inside an ITB (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ite {
    pub name: String,
    pub uuid: Uuid64,
    pub target: IteTarget,
}

impl Ite {
    pub fn new_file(name: impl Into<String>, uuid: Uuid64) -> Self {
        Self {
            name: name.into(),
            uuid,
            target: IteTarget::File { mdu: Mdu::new_file() },
        }
    }

    pub fn new_dir(name: impl Into<String>, uuid: Uuid64) -> Self {
        Self {
            name: name.into(),
            uuid,
            target: IteTarget::Dir { mdu: Mdu::new_dir() },
        }
    }

    pub fn mdu(&self) -> Option<&Mdu> {
        match &self.target {
            IteTarget::File { mdu } | IteTarget::Dir { mdu } => Some(mdu),
            IteTarget::Link { .. } => None,
        }
    }
}

/// Serialises a packed ITE array with a 4-byte little-endian length prefix.
pub fn encode(entries: &[Ite]) -> Vec<u8> {
    let body = bincode::serialize(entries).expect("Ite vec is always serializable");
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Vec<Ite>, Error> {
    if bytes.len() < 4 {
        return Err(Error::Corrupt("itb: truncated length prefix".into()));
    }
    let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    let body = bytes
        .get(4..4 + len)
        .ok_or_else(|| Error::Corrupt("itb: body shorter than length prefix".into()))?;
    bincode::deserialize(body).map_err(|e| Error::Corrupt(format!("itb decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let entries = vec![Ite::new_file("a", 11), Ite::new_dir("b", 22)];
        let bytes = encode(&entries);
        let back = decode(&bytes).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let entries = vec![Ite::new_file("a", 11)];
        let mut bytes = encode(&entries);
        bytes.truncate(bytes.len() - 1);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn link_target_carries_no_mdu() {
        let ite = Ite {
            name: "l".into(),
            uuid: 5,
            target: IteTarget::Link { source: 9 },
        };
        assert!(ite.mdu().is_none());
    }
}
