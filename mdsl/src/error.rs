use thiserror::Error;

/// Storage-engine error taxonomy (spec.md §4.2, §7: `Io`, `Corrupt`, `NotFound`, `Full`).
#[derive(Debug, Error)]
pub enum MdslError {
    #[error("no range covers itb-id {itbid} of directory {uuid:x}")]
    NotFound { uuid: u64, itbid: u64 },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt on-disk record in {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },

    #[error("append buffer exhausted for descriptor {0:x}")]
    Full(u64),
}

pub type Result<T> = std::result::Result<T, MdslError>;
