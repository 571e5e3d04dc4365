//! Error taxonomy (§7). The public API is C-ABI shaped and returns `-1` on
//! failure, but everything behind that boundary works in `Result` so callers
//! inside the crate never have to interpret a magic integer.
//!
//! No `thiserror` here: the teacher this crate is grounded on never reaches
//! for it either, preferring `anyhow` at the application edge and a manual
//! `Display`/`Error` impl for the handful of structured errors it does carry
//! (see `enforcement::SafetyGuard`'s `Result<(), String>`-style checks). A
//! library boundary needs a typed error, not a string, so this is the
//! smallest typed equivalent.

use std::fmt;

/// Every recoverable failure mode the engine can produce, matching the
/// "Error kinds, not type names" list in spec.md §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IshmemError {
    /// PE index out of `[0, n_pes)`.
    InvalidPe(i32),
    /// Team id is `INVALID`, out of `[0, TEAMS_MAX)`, or the caller is not a member.
    InvalidTeam(i32),
    /// A required pointer argument was null.
    NullPointer,
    /// A stride argument would walk outside the symmetric heap, or is zero
    /// where zero is meaningless (e.g. block size).
    MisalignedStride,
    /// The symmetric or host bounce allocator could not satisfy a request.
    AllocatorExhausted { requested: usize },
    /// The scale-out runtime plugin returned a non-zero status.
    PluginFailure(i32),
    /// Every slot in the ring is in flight. Unreachable by construction
    /// (the producer always waits for its own slot's completion before
    /// reuse, per Invariant 2) but kept as a named variant so a broken
    /// invariant fails loudly instead of corrupting memory.
    RingOverrun,
    /// A wire byte didn't decode to a known op or element type.
    MalformedRequest,
    /// Unrecoverable setup/teardown failure: heap mapping failed, the proxy
    /// thread could not be spawned, or a required plugin symbol is missing.
    /// Callers that hit this should abort, per spec.md §7; the library
    /// itself only returns it so `init()` can log before panicking.
    Fatal(String),
}

impl fmt::Display for IshmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IshmemError::InvalidPe(pe) => write!(f, "invalid PE index: {pe}"),
            IshmemError::InvalidTeam(t) => write!(f, "invalid team id: {t}"),
            IshmemError::NullPointer => write!(f, "null pointer argument"),
            IshmemError::MisalignedStride => write!(f, "stride would read/write outside the symmetric heap"),
            IshmemError::AllocatorExhausted { requested } => {
                write!(f, "symmetric allocator exhausted (requested {requested} bytes)")
            }
            IshmemError::PluginFailure(status) => write!(f, "runtime plugin returned status {status}"),
            IshmemError::RingOverrun => write!(f, "request ring overrun"),
            IshmemError::MalformedRequest => write!(f, "malformed ring request"),
            IshmemError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for IshmemError {}

impl From<ishmem_wire::UnknownTag> for IshmemError {
    fn from(_: ishmem_wire::UnknownTag) -> Self {
        IshmemError::MalformedRequest
    }
}

pub type Result<T> = std::result::Result<T, IshmemError>;

/// Collapse a `Result` into the C-ABI-shaped status the public API returns:
/// `0` on success, `-1` on any error (§7: "returns -1 where an int is
/// returned"). The error is logged at `warn!` before being discarded so the
/// information isn't silently lost.
pub fn status_of<T>(result: Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => {
            log::warn!("operation failed: {e}");
            -1
        }
    }
}
