//! Error types for vchan setup, I/O and teardown (spec.md §7).

use thiserror::Error;

/// Everything that can go wrong building or driving a [`crate::Endpoint`].
#[derive(Debug, Error)]
pub enum VchanError {
    /// The peer's directory entries were missing, unparseable, or zero.
    #[error("directory lookup failed for device {devno}: {reason}")]
    DirectoryLookup {
        /// Device number being looked up.
        devno: u32,
        /// Human-readable reason (missing entry, zero value, ...).
        reason: &'static str,
    },

    /// Grant allocation or mapping was rejected by the backend.
    #[error("grant {op} failed: {reason}")]
    Grant {
        /// `"alloc"` or `"import"`.
        op: &'static str,
        /// Backend-provided reason.
        reason: String,
    },

    /// The event channel could not be bound.
    #[error("event channel bind failed: {0}")]
    EventBind(String),

    /// `left_order`/`right_order` read from the shared page violate §3.1's
    /// range or uniqueness constraints.
    #[error("invalid ring order: {0}")]
    InvalidOrder(&'static str),

    /// A ring size requested by `server_init` exceeds the page's grant-list
    /// capacity (see `original_source/init.c`'s `MAX_RING_SIZE`).
    #[error("requested ring size {requested} exceeds the {max} byte ceiling")]
    RingTooLarge {
        /// The byte size that was requested.
        requested: usize,
        /// The ceiling it was checked against.
        max: usize,
    },

    /// Caller requested a packet-mode transfer larger than the ring itself;
    /// no sequence of waits can ever satisfy it.
    #[error("packet of {requested} bytes cannot fit in a ring of size {ring_size}")]
    PacketTooLarge {
        /// Bytes the caller asked to transfer atomically.
        requested: usize,
        /// Size of the ring that would have to hold it.
        ring_size: usize,
    },

    /// The peer's liveness byte reads 0: for sends this is immediate, for
    /// receives it is only raised once the ring has drained (spec.md §7).
    #[error("peer has closed the channel")]
    PeerClosed,

    /// An underlying OS call (`mmap`, `read`, `write`, `ioctl`-equivalent)
    /// failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type VchanResult<T> = Result<T, VchanError>;
