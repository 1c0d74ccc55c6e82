//! Load a secondary module into the running sandbox, execute its entry
//! point, and roll linear memory back afterwards.
//!
//! The dynamic loader lives inside the sandbox and keeps its state across
//! invocations, so without the snapshot/restore pair one run would leak
//! into the next. Only the exit code survives a run.

use tracing::{debug, error, warn};
use wasmtime::{AsContextMut, Val};

use super::instance::{as_i32, SandboxHandle};
use super::marshal::StringArg;
use super::runtime::HostState;
use crate::error::{Result, WasmPosixError};

/// Loader export that opens a library and returns a handle.
pub const DLOPEN: &str = "dlopen";

/// Loader export that maps (handle, symbol name) to a function pointer.
pub const DLSYM: &str = "dlsym";

/// Loader export that unloads a handle.
pub const DLCLOSE: &str = "dlclose";

/// Entry point every runnable library exports, called as `(argc, argv)`.
pub const ENTRY_POINT: &str = "__main_argc_argv";

/// Sandbox pointers the host keeps between calls.
#[derive(Debug, Clone, Copy)]
struct HostPointers {
    scratch: Option<u32>,
    ctermid: Option<u32>,
}

impl HostPointers {
    fn save<S>(store: &mut S) -> Self
    where
        S: AsContextMut<Data = HostState>,
    {
        let cx = store.as_context_mut();
        let data = cx.data();
        Self {
            scratch: data.call.scratch,
            ctermid: data.posix.ctermid,
        }
    }

    fn put_back<S>(self, store: &mut S)
    where
        S: AsContextMut<Data = HostState>,
    {
        let mut cx = store.as_context_mut();
        let data = cx.data_mut();
        data.call.scratch = self.scratch;
        data.posix.ctermid = self.ctermid;
    }
}

impl SandboxHandle {
    /// Run `argv[0]` as if it were a fresh process and return its exit code.
    ///
    /// Loader failures that a shell would report (missing `dlsym`, missing
    /// entry point, missing `dlclose`) are logged and give exit code 1. Calls
    /// that fail outright propagate. Either way linear memory is restored to
    /// its exact pre-call bytes before returning.
    pub fn run<S>(&self, store: &mut S, argv: &[String]) -> Result<i32>
    where
        S: AsContextMut<Data = HostState>,
    {
        let path = argv.first().ok_or_else(|| {
            WasmPosixError::InvalidArgument("argv must have length at least 1".to_string())
        })?;

        let snapshot = self.snapshot(&*store);
        let cached = HostPointers::save(store);
        debug!("run {:?} ({} byte snapshot)", argv, snapshot.len());
        let outcome = self.load_and_execute(store, path, argv);
        self.restore(store, &snapshot);
        // Blocks allocated during the run are gone with the restore.
        cached.put_back(store);
        outcome
    }

    fn load_and_execute<S>(&self, store: &mut S, path: &str, argv: &[String]) -> Result<i32>
    where
        S: AsContextMut<Data = HostState>,
    {
        let output = self.call_with_string(store, DLOPEN, StringArg::One(path), &[])?;
        let handle = as_i32(&output, DLOPEN)?;

        let Some(dlsym) = self.get_function(store, DLSYM) else {
            error!("{}: dlsym not defined", path);
            return Ok(1);
        };

        let main_ptr = self.scoped(store, |store, allocs| {
            let symbol = allocs.track(self.send_string(store, ENTRY_POINT, None)?);
            let ptr = self.call_raw(store, &dlsym, &[Val::I32(handle), Val::I32(symbol as i32)])?;
            Ok(ptr.and_then(|v| v.i32()).unwrap_or(0))
        })?;
        if main_ptr == 0 {
            error!("{}: unable to find main pointer", path);
            return Ok(1);
        }

        let Some(main) = self.table_function(store, main_ptr as u32) else {
            error!("{}: unable to find main function", path);
            return Ok(1);
        };

        let exit_code = self.scoped(store, |store, allocs| {
            let argv_ptr = self.send_strings(store, argv, allocs)?;
            let output = self.invoke(
                store,
                ENTRY_POINT,
                &main,
                &[Val::I32(argv.len() as i32), Val::I32(argv_ptr as i32)],
            )?;
            Ok(output.as_i64().unwrap_or(0) as i32)
        })?;

        let Some(dlclose) = self.get_function(store, DLCLOSE) else {
            error!("{}: dlclose not defined", path);
            return Ok(1);
        };
        if let Err(e) = self.call_raw(store, &dlclose, &[Val::I32(handle)]) {
            warn!("{}: dlclose failed: {}", path, e);
        }

        debug!("{} exited with {}", path, exit_code);
        Ok(exit_code)
    }
}
