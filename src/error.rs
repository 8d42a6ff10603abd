use thiserror::Error;

/// Host-level errors. Lisp-level errors (`type-error`, `eval-error`,
/// `out-of-memory`, ...) are reserved symbols that flow through evaluation
/// as ordinary values; this enum covers the conditions a host embedding
/// the runtime has to deal with in Rust.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The reader could not produce an expression.
    #[error("read error: {0}")]
    Read(String),

    /// A configured region could not be set up at init.
    #[error("init error: {0}")]
    Init(String),

    /// The GC marking stack overflowed. Fatal: the heap can no longer be
    /// collected safely.
    #[error("GC mark stack overflow")]
    MarkStackOverflow,

    /// A continuation stack was popped while empty, or a frame was
    /// malformed. Indicates an interpreter bug, not a program error.
    #[error("continuation stack corrupt: {0}")]
    StackCorrupt(&'static str),

    /// A constant-heap write tried to change an already-written word.
    #[error("constant heap write conflict at index {0}")]
    ConstConflict(u32),

    /// Image file could not be read or has the wrong shape.
    #[error("image error: {0}")]
    Image(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
