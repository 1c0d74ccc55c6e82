//! Error types for the wasm-posix crate.

use thiserror::Error;

/// Error type shared by the runtime, the syscall bridge and the worker channel.
#[derive(Error, Debug)]
pub enum WasmPosixError {
    /// Requested export or symbol is absent
    #[error("no function {0} defined in wasm module")]
    NotFound(String),

    /// The sandbox allocator returned a null pointer
    #[error("out of memory: sandbox allocator returned null for {0} bytes")]
    OutOfMemory(usize),

    /// The sandbox set its exception flag during a call
    #[error("runtime error raised by sandbox in {0}")]
    RuntimeError(String),

    /// A host capability needed by a syscall is not available
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The worker failed to load or instantiate its module
    #[error("worker init failed: {0}")]
    WorkerInitError(String),

    /// Engine, compilation or link failure
    #[error("WASM error: {0}")]
    Wasm(String),

    /// The sandbox trapped
    #[error("trap: {0}")]
    Trap(String),

    /// The sandbox reported that a resource is unavailable
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Caller passed an argument the operation cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Linear memory access outside the current buffer
    #[error("memory access out of bounds at {ptr:#x} (+{len})")]
    OutOfBounds {
        /// Start address
        ptr: usize,
        /// Access length in bytes
        len: usize,
    },

    /// The syscall bridge was used before `init` bound it to an instance
    #[error("syscall bridge is not bound to an instance")]
    NotBound,

    /// `init` was called on a bridge that is already bound
    #[error("syscall bridge is already bound to an instance")]
    AlreadyBound,

    /// A worker message did not follow the request/reply protocol
    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// A call relayed to the worker failed there
    #[error("worker call failed: {0}")]
    WorkerCallError(String),

    /// The worker thread went away
    #[error("worker disconnected")]
    WorkerDisconnected,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WasmPosixError {
    /// Recover a crate error that travelled through wasmtime as a trap.
    ///
    /// Host functions return our errors inside `wasmtime::Error`; if one of
    /// them ends the call, the original kind is preserved.
    pub(crate) fn from_call(err: wasmtime::Error) -> Self {
        match err.downcast::<WasmPosixError>() {
            Ok(inner) => inner,
            Err(other) => WasmPosixError::Trap(format!("{:#}", other)),
        }
    }
}

/// Result type alias for wasm-posix operations
pub type Result<T> = std::result::Result<T, WasmPosixError>;
