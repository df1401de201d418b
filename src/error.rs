//! Error types for the marking engine.

use std::fmt;

/// Errors surfaced by marking operations.
///
/// Most marking failures (stack overflow, step timeout, yield requests) are
/// internal control flow and never escape the engine; the variants here are
/// the ones an embedder can observe.
///
/// # Examples
///
/// ```
/// use conmark::error::{MarkError, MarkResult};
///
/// let aborted: MarkResult<()> = Err(MarkError::CycleAborted);
/// assert!(aborted.is_err());
/// assert_eq!(
///     MarkError::MarkStackExpansionFailed { chunks: 1024 }.to_string(),
///     "mark stack cannot expand past 1024 chunks",
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkError {
    /// The global mark stack hit its configured maximum while an overflow
    /// restart required more room.
    MarkStackExpansionFailed { chunks: usize },
    /// The cycle was aborted (full collection or explicit abort) before
    /// marking could complete.
    CycleAborted,
    /// A region list traversal exceeded the configured length bound,
    /// indicating structural corruption.
    StructureCycle { list: &'static str, length: u32 },
    /// Reference processing overflowed the mark stack; liveness information
    /// can no longer be trusted.
    ReferenceOverflow,
}

impl fmt::Display for MarkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkError::MarkStackExpansionFailed { chunks } => {
                write!(f, "mark stack cannot expand past {} chunks", chunks)
            }
            MarkError::CycleAborted => write!(f, "concurrent marking cycle aborted"),
            MarkError::StructureCycle { list, length } => {
                write!(
                    f,
                    "region list '{}' traversal reached {} nodes, likely a cycle",
                    list, length
                )
            }
            MarkError::ReferenceOverflow => {
                write!(f, "mark stack overflow during reference processing")
            }
        }
    }
}

impl std::error::Error for MarkError {}

/// Result type for marking operations.
pub type MarkResult<T> = Result<T, MarkError>;
