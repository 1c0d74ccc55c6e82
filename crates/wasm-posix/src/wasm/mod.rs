//! Module instances on top of wasmtime.
//!
//! This module owns everything that touches a sandbox directly: compiling
//! and instantiating modules, resolving callables, marshaling strings and
//! buffers through linear memory, and the dynamic load/execute primitive.
//!
//! ## Memory Convention
//!
//! - Pointers are i32 (WASM32 address space); `sizeof(char*) == 4`
//! - Strings are UTF-8, NUL-terminated
//! - Allocation goes through the module's `c_malloc`/`c_free` exports
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wasm_posix::{WasmRuntime, RuntimeConfig};
//!
//! let runtime = WasmRuntime::new(RuntimeConfig::default())?;
//! let module = runtime.load_module("python.wasm")?;
//! let mut instance = runtime.instantiate(&module)?;
//!
//! let output = instance.call_with_string("eval", "1 + 1", &[])?;
//! let code = instance.run(&["ls.so".to_string(), "-l".to_string()])?;
//! ```

mod callbacks;
mod config;
mod instance;
mod marshal;
mod run;
mod runtime;

pub use config::{RuntimeConfig, WasiCapabilities, DEFAULT_TERM, SMALL_STRING_SIZE};
pub use instance::{CallState, ModuleInstance, SandboxHandle, FORWARD_PREFIX, MEMORY_EXPORT, TABLE_EXPORT};
pub use marshal::{Destination, StringArg, FREE, MALLOC, POINTER_SIZE};
pub use run::{DLCLOSE, DLOPEN, DLSYM, ENTRY_POINT};
pub use runtime::{HostState, WasmModule, WasmRuntime};
