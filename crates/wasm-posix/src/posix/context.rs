//! What a handler sees while it runs.

use nix::errno::Errno;
use std::sync::Arc;
use tracing::debug;
use wasmtime::{Caller, Val};

use super::bindings::{HostBindings, HostError, HostResult};
use super::{SyscallBridge, SET_ERRNO};
use crate::error::{Result, WasmPosixError};
use crate::wasm::{Destination, HostState, SandboxHandle};

/// The calling instance (through its `Caller`) and the bridge serving it.
pub struct SyscallContext<'a, 'b> {
    caller: &'a mut Caller<'b, HostState>,
    bridge: &'a SyscallBridge,
}

impl<'a, 'b> SyscallContext<'a, 'b> {
    pub(crate) fn new(caller: &'a mut Caller<'b, HostState>, bridge: &'a SyscallBridge) -> Self {
        Self { caller, bridge }
    }

    /// The bridge this handler belongs to.
    pub fn bridge(&self) -> &'a SyscallBridge {
        self.bridge
    }

    /// Host bindings.
    pub fn bindings(&self) -> Arc<dyn HostBindings> {
        Arc::clone(self.bridge.capabilities().bindings())
    }

    /// The bound instance, or `NotBound` before `init`.
    pub fn handle(&self) -> Result<SandboxHandle> {
        self.bridge.handle()
    }

    /// Store data of the calling instance.
    pub fn data_mut(&mut self) -> &mut HostState {
        self.caller.data_mut()
    }

    /// Read `len` bytes of sandbox memory.
    pub fn read_memory(&mut self, ptr: u32, len: usize) -> Result<Vec<u8>> {
        self.handle()?.read_memory(&*self.caller, ptr, len)
    }

    /// Write bytes into sandbox memory.
    pub fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        self.handle()?.write_memory(&mut *self.caller, ptr, bytes)
    }

    /// Read a NUL-terminated string.
    pub fn read_string(&mut self, ptr: u32) -> Result<String> {
        self.handle()?.read_string(&*self.caller, ptr)
    }

    /// See [`SandboxHandle::send_string`].
    pub fn send_string(&mut self, text: &str, dest: Option<Destination>) -> Result<u32> {
        self.handle()?.send_string(&mut *self.caller, text, dest)
    }

    /// Run a library from inside a syscall. The call state of the call in
    /// flight is kept aside and put back afterwards.
    pub fn run(&mut self, argv: &[String]) -> Result<i32> {
        let handle = self.handle()?;
        let call = &mut self.data_mut().call;
        let result = call.result.take();
        let exception = std::mem::take(&mut call.exception);

        let code = handle.run(&mut *self.caller, argv);

        let call = &mut self.data_mut().call;
        call.result = result;
        call.exception = exception;
        code
    }

    /// Record a failed syscall: translate `errno` to the sandbox's numbering,
    /// keep it as the last error and hand it to `setErrno` if exported.
    pub fn set_errno(&mut self, errno: Errno) -> Result<i32> {
        let value = match self.bridge.constants() {
            Some(constants) => constants.errno(errno),
            None => errno as i32,
        };
        debug!("errno {:?} -> {}", errno, value);
        self.data_mut().posix.last_errno = value;

        let handle = self.handle()?;
        if let Some(set_errno) = handle.get_function(&mut *self.caller, SET_ERRNO) {
            handle.call_raw(&mut *self.caller, &set_errno, &[Val::I32(value)])?;
        }
        Ok(value)
    }

    /// Turn a host failure into a syscall outcome: an errno plus `ret`, or
    /// `NotImplemented` when the host lacks the capability.
    pub fn fail(&mut self, err: HostError, ret: i32) -> Result<i32> {
        match err {
            HostError::Unsupported(name) => Err(WasmPosixError::NotImplemented(name.to_string())),
            HostError::Os(errno) => {
                self.set_errno(errno)?;
                Ok(ret)
            }
        }
    }

    /// Pass a successful value through, or fail with -1.
    pub fn check(&mut self, res: HostResult<i32>) -> Result<i32> {
        match res {
            Ok(value) => Ok(value),
            Err(err) => self.fail(err, -1),
        }
    }
}
