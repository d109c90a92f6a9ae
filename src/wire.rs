//! On-wire request/reply framing (spec.md §6): a fixed 64-byte `tx` header
//! followed by a concatenation of `{u32 length, bytes}` sections.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{AsBytes, FromBytes};

pub const TX_MAGIC: u32 = 0x4856_4653;
pub const TX_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Command {
    R2Reg = 1,
    R2Unreg = 2,
    R2Update = 3,
    R2Mkfs = 4,
    R2Hb = 5,
    R2Bitmap = 6,
    R2Lgdt = 7,
    R2Lbgdt = 8,
    R2Online = 9,
    R2Offline = 10,
    Mds2MdsAusplit = 20,
    Mds2MdsAubitmap = 21,
    Mds2MdsAubitmapR = 22,
    Mds2MdsLdh = 23,
    Mds2MdsLb = 24,
    Mds2MdslItb = 30,
    Mds2MdslBitmap = 31,
    Mds2MdslWbtxg = 32,
    Mds2MdslWdata = 33,
    Mds2MdslBtcommit = 34,
    Clt2MdslRead = 40,
    Clt2MdslWrite = 41,
    Clt2MdslStatfs = 42,
}

/// Request/reply flag bits. Plain bit constants rather than a flags crate,
/// matching the hand-rolled bit tricks the rest of the wire layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFlags(u32);

impl RequestFlags {
    /// Mirrors `HVFS_CLT2_MDS_NODHLOOKUP`: the caller already resolved the
    /// directory hash entry and is asking us to skip the lookup.
    pub const NO_DH_LOOKUP: RequestFlags = RequestFlags(1 << 0);
    pub const WITH_MDU: RequestFlags = RequestFlags(1 << 1);
    pub const WITH_LS: RequestFlags = RequestFlags(1 << 2);
    pub const DIR_SDT: RequestFlags = RequestFlags(1 << 3);
    pub const READDIR: RequestFlags = RequestFlags(1 << 4);

    pub fn from_bits_truncate(bits: u32) -> Self {
        RequestFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: RequestFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RequestFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for RequestFlags {
    type Output = RequestFlags;
    fn bitor(self, rhs: RequestFlags) -> RequestFlags {
        RequestFlags(self.0 | rhs.0)
    }
}

/// Fixed 64-byte request/reply header.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct TxHeader {
    pub magic: u32,
    pub version: u16,
    pub cmd: u16,
    pub flags: u32,
    pub len: u32,
    pub reqno: u64,
    pub ssite: u64,
    pub dsite: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub handle: u64,
    pub reserved: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<TxHeader>() == 64);

impl TxHeader {
    pub fn new(cmd: Command, ssite: u64, dsite: u64, reqno: u64) -> Self {
        Self {
            magic: TX_MAGIC,
            version: TX_VERSION,
            cmd: cmd as u16,
            flags: 0,
            len: 0,
            reqno,
            ssite,
            dsite,
            arg0: 0,
            arg1: 0,
            handle: 0,
            reserved: 0,
            _pad: 0,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.cmd).ok()
    }

    pub fn flags(&self) -> RequestFlags {
        RequestFlags::from_bits_truncate(self.flags)
    }
}

/// Appends a length-prefixed section to `out`.
pub fn push_section(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Iterates length-prefixed sections out of a body buffer.
pub fn iter_sections(mut body: &[u8]) -> impl Iterator<Item = &[u8]> {
    std::iter::from_fn(move || {
        if body.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
        let rest = &body[4..];
        if rest.len() < len {
            return None;
        }
        let (section, tail) = rest.split_at(len);
        body = tail;
        Some(section)
    })
}

/// A full framed message: header plus its concatenated sections.
pub struct Message {
    pub header: TxHeader,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(mut header: TxHeader, sections: &[&[u8]]) -> Self {
        let mut body = Vec::new();
        for s in sections {
            push_section(&mut body, s);
        }
        header.len = body.len() as u32;
        Self { header, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 64 {
            return None;
        }
        let header = TxHeader::read_from(&buf[..64])?;
        if header.magic != TX_MAGIC {
            return None;
        }
        let body = buf[64..64 + header.len as usize].to_vec();
        Some(Self { header, body })
    }

    pub fn sections(&self) -> impl Iterator<Item = &[u8]> {
        iter_sections(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = TxHeader::new(Command::R2Reg, 1, 2, 99);
        let bytes = header.as_bytes().to_vec();
        let back = TxHeader::read_from(&bytes[..]).unwrap();
        assert_eq!(back.cmd, Command::R2Reg as u16);
        assert_eq!(back.reqno, 99);
    }

    #[test]
    fn message_round_trips_with_sections() {
        let header = TxHeader::new(Command::R2Bitmap, 1, 3, 7);
        let msg = Message::new(header, &[b"hello", b"world"]);
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        let sections: Vec<&[u8]> = decoded.sections().collect();
        assert_eq!(sections, vec![b"hello".as_slice(), b"world".as_slice()]);
        assert_eq!(decoded.header.command(), Some(Command::R2Bitmap));
    }

    #[test]
    fn unknown_command_code_is_none() {
        let mut header = TxHeader::new(Command::R2Reg, 0, 0, 0);
        header.cmd = 0xffff;
        assert!(header.command().is_none());
    }

    #[test]
    fn no_dh_lookup_flag_round_trips() {
        let mut header = TxHeader::new(Command::Clt2MdslRead, 0, 0, 0);
        header.flags = RequestFlags::NO_DH_LOOKUP.bits();
        assert!(header.flags().contains(RequestFlags::NO_DH_LOOKUP));
    }
}
