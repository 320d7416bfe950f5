use std::io;

use thiserror::Error;

/// Fatal, server-level failures.
///
/// Per-connection transport trouble never surfaces here; it is absorbed at
/// connection granularity. These are the conditions a server cannot
/// continue past.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The monotonic 31-bit handle space ran out.
    #[error("connection handle space exhausted")]
    HandleOverflow,

    /// More simultaneous connections than the arena can tag.
    #[error("connection arena is full")]
    ArenaFull,

    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
}
