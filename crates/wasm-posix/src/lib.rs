//! # wasm-posix
//!
//! Run WebAssembly modules as if they were ordinary POSIX processes.
//!
//! A module compiled against a libc (CPython, a shell, coreutils) expects to
//! call into the kernel, load shared libraries and block on the terminal.
//! This crate hosts such a module in wasmtime and supplies the missing pieces:
//!
//! | Layer | Module | What it does |
//! |-------|--------|--------------|
//! | Marshaling | [`wasm`] | strings, argv arrays and buffers across linear memory |
//! | Symbol resolution | [`wasm`] | `__WASM_EXPORT__` forwarding over direct exports |
//! | Load/execute | [`wasm`] | `run(argv)`: dlopen, call `main`, roll memory back |
//! | Syscall bridge | [`posix`] | `env` imports for the libc calls WASI lacks |
//! | Worker channel | [`worker`] | instance on a thread, blocking I/O via a futex |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wasm_posix::{RuntimeConfig, WasmRuntime};
//!
//! let runtime = WasmRuntime::new(RuntimeConfig::terminal())?;
//! let module = runtime.load_module("python.wasm")?;
//! let mut instance = runtime.instantiate(&module)?;
//!
//! let sum = instance.call("add", &[2, 3])?;
//! let code = instance.run(&["ls.so".into(), "-l".into()])?;
//! let eagain = instance.constants().and_then(|c| c.get("EAGAIN"));
//! ```
//!
//! ## Features
//!
//! - `native` (default) - host bindings backed by the local OS via `nix`

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod posix;
pub mod wasm;
pub mod worker;

// Re-export main types
pub use error::{Result, WasmPosixError};
pub use posix::{Capabilities, Constants, HostBindings, ImportMap, Syscall, SyscallBridge};
pub use wasm::{
    Destination, ModuleInstance, RuntimeConfig, SandboxHandle, StringArg, WasiCapabilities,
    WasmModule, WasmRuntime,
};
pub use worker::{WorkerChannel, WorkerOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WasmPosixError::NotFound("dlsym".to_string());
        assert_eq!(err.to_string(), "no function dlsym defined in wasm module");

        let err = WasmPosixError::OutOfBounds { ptr: 16, len: 4 };
        assert_eq!(err.to_string(), "memory access out of bounds at 0x10 (+4)");
    }

    #[test]
    fn test_error_through_wasmtime() {
        let err = wasmtime::Error::new(WasmPosixError::NotImplemented("statvfs".to_string()));
        assert!(matches!(
            WasmPosixError::from_call(err),
            WasmPosixError::NotImplemented(name) if name == "statvfs"
        ));

        let err = wasmtime::Error::msg("unreachable executed");
        assert!(matches!(WasmPosixError::from_call(err), WasmPosixError::Trap(_)));
    }
}
