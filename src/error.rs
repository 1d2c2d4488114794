//! Unified error type for the voxtile library.
//!
//! Library code uses `VoxtileError` while the CLI binary uses `anyhow::Result`
//! for top-level context. The variants follow the pipeline's failure taxonomy:
//!
//! - **Io**: file system operations (open, read, write) with path context
//! - **Format**: invalid tile or volume file (magic bytes, version, layout)
//! - **Config**: invalid parameters or configuration-consistency violations
//! - **ShapeMismatch**: a tile payload does not match its expected placement
//! - **MaskInvariant**: a one-hot mask postcondition was violated
//! - **MemoryBudget**: the per-worker memory precondition failed
//! - **Aborted**: a cooperating worker failed and the phase was torn down

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Unified error type for the voxtile library.
#[derive(Debug)]
pub enum VoxtileError {
    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Invalid file format (magic bytes, version, structure).
    Format { path: PathBuf, detail: String },

    /// Invalid configuration or parameter-consistency violation.
    Config(String),

    /// A payload's shape disagrees with its expected placement.
    ShapeMismatch {
        context: String,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    /// One-hot mask postcondition violated (malformed probability map).
    MaskInvariant { context: String, detail: String },

    /// Estimated per-tile memory exceeds the configured worker budget.
    MemoryBudget { required: usize, budget: usize },

    /// The run was torn down because another worker failed.
    Aborted(String),
}

impl fmt::Display for VoxtileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoxtileError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            VoxtileError::Format { path, detail } => {
                write!(f, "Invalid format in '{}': {}", path.display(), detail)
            }
            VoxtileError::Config(msg) => write!(f, "Configuration error: {}", msg),
            VoxtileError::ShapeMismatch {
                context,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Shape mismatch in {}: expected {:?}, got {:?}",
                    context, expected, actual
                )
            }
            VoxtileError::MaskInvariant { context, detail } => {
                write!(f, "Mask invariant violated in {}: {}", context, detail)
            }
            VoxtileError::MemoryBudget { required, budget } => {
                write!(
                    f,
                    "Per-tile memory requirement of {} bytes exceeds the worker budget of {} bytes; \
                     reduce the tile dimensions and retry",
                    required, budget
                )
            }
            VoxtileError::Aborted(msg) => write!(f, "Run aborted: {}", msg),
        }
    }
}

impl std::error::Error for VoxtileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VoxtileError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VoxtileError {
    fn from(err: std::io::Error) -> Self {
        VoxtileError::Io {
            path: PathBuf::new(),
            operation: "unknown",
            source: err,
        }
    }
}

/// Convenience type alias for Results using VoxtileError.
pub type Result<T> = std::result::Result<T, VoxtileError>;

impl VoxtileError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        VoxtileError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create a format error.
    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        VoxtileError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        VoxtileError::Config(msg.into())
    }

    /// Create a shape-mismatch error.
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: [usize; 3],
        actual: [usize; 3],
    ) -> Self {
        VoxtileError::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Create a mask-invariant error.
    pub fn mask_invariant(context: impl Into<String>, detail: impl Into<String>) -> Self {
        VoxtileError::MaskInvariant {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Create an abort error.
    pub fn aborted(msg: impl Into<String>) -> Self {
        VoxtileError::Aborted(msg.into())
    }
}

// ============================================================================
// Thread-safe error capture
// ============================================================================

/// Stores only the first error reported by a pool of cooperating workers.
///
/// When one worker fails mid-phase the others are woken with `Aborted`
/// errors; the capture keeps the original failure so the run reports the
/// actual cause rather than a secondary teardown error.
pub struct FirstErrorCapture {
    has_error: AtomicBool,
    error: Mutex<Option<VoxtileError>>,
}

impl FirstErrorCapture {
    pub fn new() -> Self {
        Self {
            has_error: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Store an error unless one is already present. Returns true if stored.
    pub fn store(&self, err: VoxtileError) -> bool {
        if self
            .has_error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Ok(mut guard) = self.error.lock() {
                *guard = Some(err);
            }
            true
        } else {
            false
        }
    }

    /// Take the stored error, if any.
    pub fn take(&self) -> Option<VoxtileError> {
        if self.has_error.load(Ordering::SeqCst) {
            self.error.lock().ok().and_then(|mut g| g.take())
        } else {
            None
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }
}

impl Default for FirstErrorCapture {
    fn default() -> Self {
        Self::new()
    }
}
