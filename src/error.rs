use std::io;
use thiserror::Error;

/// Errors surfaced by the transport layer.
///
/// Timeouts do *not* close the connection - the caller decides whether to retry or give up.
/// `Closed` is terminal: the peer has left the group, the ACK retry budget was exceeded, or
/// the connection was closed locally.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A read did not complete within the configured timeout. The connection stays open.
    #[error("timed out waiting for data to read")]
    TimeoutRead,

    /// A write could not obtain a free buffer within the configured timeout. The connection
    /// stays open.
    #[error("timed out waiting for a free write buffer")]
    TimeoutWrite,

    /// The connection is closed; blocked readers observe this after draining pending data.
    #[error("connection is closed")]
    Closed,

    /// No unused 16-bit peer id could be claimed on the multicast group.
    #[error("could not claim a peer id after {attempts} attempts")]
    NoId { attempts: u32 },

    /// The operation is not supported by this connection type (e.g. `write` on a reader).
    #[error("operation not supported by this connection")]
    Unsupported,

    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the object layer to the thread performing `sync`/`apply_map_data`.
#[derive(Debug, Error)]
pub enum ObjectError {
    /// A version stream was applied out of order. This indicates a programming error on the
    /// sender side, not a wire error.
    #[error("version {got} cannot be applied at version {current}")]
    VersionMismatch { current: u128, got: u128 },

    /// The object did not consume all data of an applied version stream.
    #[error("object left {remaining_bytes} bytes in {remaining_buffers} buffer(s) unconsumed")]
    IncompleteConsume {
        remaining_bytes: usize,
        remaining_buffers: usize,
    },

    /// The object read past the end of the version stream.
    #[error("version stream exhausted while reading {what}")]
    StreamExhausted { what: &'static str },

    /// A map request could not be satisfied (e.g. requested version newer than head).
    #[error("cannot map at version {requested}: head is {head}")]
    MapFailed { requested: u128, head: u128 },

    /// The stream popped by `apply_map_data` was not an instance stream.
    #[error("expected an instance stream for map data")]
    NotInstanceData,

    /// The master for this object is not reachable.
    #[error("master is unreachable")]
    MasterUnreachable,

    /// `sync` did not reach the requested version within the configured timeout.
    #[error("timed out waiting for version {waiting_for}")]
    SyncTimeout { waiting_for: u128 },

    /// Decoded payload declared an unknown compressor id.
    #[error("unknown compressor id {0}")]
    UnknownCompressor(u32),
}

pub type TransportResult<T> = Result<T, TransportError>;
pub type ObjectResult<T> = Result<T, ObjectError>;
