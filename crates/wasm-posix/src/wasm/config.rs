//! Configuration for the WASM runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Strings shorter than this many bytes are passed through the reused
/// scratch buffer instead of a fresh allocation.
pub const SMALL_STRING_SIZE: usize = 8 * 1024;

/// Terminal type exported to sandboxed programs by the terminal preset.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// WASI capability grants for a module instance.
///
/// Everything starts disabled; presets and builder methods opt in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Allow access to stdin
    pub stdin: bool,

    /// Allow access to stdout
    pub stdout: bool,

    /// Allow access to stderr
    pub stderr: bool,

    /// Directories to pre-open read-only
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Directories to pre-open read-write
    pub preopened_dirs_rw: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// Nothing allowed
    pub fn none() -> Self {
        Self::default()
    }

    /// Stdio inherited from the host
    pub fn with_stdio() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Stdio plus the terminal environment an interactive program expects.
    pub fn terminal() -> Self {
        Self::with_stdio().env("TERM", DEFAULT_TERM)
    }

    /// Builder: enable stdin
    pub fn stdin(mut self, allow: bool) -> Self {
        self.stdin = allow;
        self
    }

    /// Builder: enable stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: enable stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add read-only directory
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add read-write directory
    pub fn preopened_dir_rw(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_rw.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for the WASM runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// WASI capability configuration
    pub capabilities: WasiCapabilities,

    /// Maximum linear memory in bytes
    pub max_memory: usize,

    /// Fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Scratch buffer size used by `call_with_string`
    pub small_string_size: usize,

    /// Cache config for compiled modules
    pub cache_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            capabilities: WasiCapabilities::with_stdio(),
            max_memory: 1024 * 1024 * 1024, // 1 GB
            fuel_limit: None,
            optimization_level: 2,
            enable_simd: true,
            small_string_size: SMALL_STRING_SIZE,
            cache_path: None,
        }
    }
}

impl RuntimeConfig {
    /// No WASI grants, small memory, fuel metered
    pub fn minimal() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_limit: Some(1_000_000_000),
            ..Default::default()
        }
    }

    /// Interactive terminal programs
    pub fn terminal() -> Self {
        Self {
            capabilities: WasiCapabilities::terminal(),
            ..Default::default()
        }
    }

    /// Faster compilation for debugging
    pub fn development() -> Self {
        Self {
            optimization_level: 0,
            ..Default::default()
        }
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: WasiCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Builder: set the scratch string threshold
    pub fn small_string_size(mut self, bytes: usize) -> Self {
        self.small_string_size = bytes.max(1);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }
}
