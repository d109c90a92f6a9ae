//! Metadata-plane core: hash ring + address table (C1), directory hash +
//! bitmap cache (C3), concurrent extendible hash table of ITB buckets (C4),
//! and the TXG commit path (C5) that ties them to the MDSL storage engine
//! (C2, the `mdsl` crate) and the R2 registry (C6).

pub mod cbht;
pub mod config;
pub mod dh;
pub mod error;
pub mod hash;
pub mod itb;
pub mod logging;
pub mod mds_ops;
pub mod net;
pub mod node;
pub mod r2;
pub mod ring;
pub mod txg;
pub mod types;
pub mod wire;

pub use error::{Error, ErrorKind, Result};
pub use node::{MdsNode, R2Node};
pub use types::{Fsid, ItbId, Role, SiteId, Txg, Uuid64};
