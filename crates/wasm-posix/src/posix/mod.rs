//! POSIX syscall bridge.
//!
//! Sandbox code reaches the host through `env` imports named after the libc
//! function they stand in for. The bridge owns those handlers and the host
//! capabilities they run against.
//!
//! ## Two-phase binding
//!
//! Handlers must exist as imports before the module can be instantiated, but
//! most of them need the live instance to do anything (read a path, write a
//! result, report an errno). So the bridge is built first from capabilities
//! alone, its handlers are linked, and only after instantiation does
//! [`SyscallBridge::init`] bind it to the instance and fetch the constants
//! table. A handler called before that fails with `NotBound`.
//!
//! ## Errors
//!
//! A host error is not a trap: the handler stores the errno (translated to
//! the sandbox's numbering) and returns the POSIX failure value. A missing
//! host capability is different and fails the call with `NotImplemented`.

mod bindings;
mod constants;
mod context;
mod io;
mod other;
mod process;
mod unistd;

pub use bindings::{default_bindings, HostBindings, HostError, HostResult, NoBindings};
#[cfg(all(unix, feature = "native"))]
pub use bindings::NativeBindings;
pub use constants::{Constants, EXPORT as CONSTANTS_EXPORT};
pub use context::SyscallContext;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, trace};
use wasmtime::{AsContextMut, Caller, Engine, FuncType, Linker, Val, ValType};

use crate::error::{Result, WasmPosixError};
use crate::wasm::{HostState, SandboxHandle};
use crate::worker::BlockingClient;

/// Import namespace of the bridge's handlers.
pub const ENV_MODULE: &str = "env";

/// Optional sandbox export that receives the errno after a failed syscall.
pub const SET_ERRNO: &str = "setErrno";

/// Per-store POSIX state.
#[derive(Debug, Default)]
pub struct PosixState {
    /// Last errno recorded by a handler, in sandbox numbering
    pub last_errno: i32,
    pub(crate) ctermid: Option<u32>,
}

/// Signature of a raw handler.
pub type HandlerFn =
    dyn Fn(&mut SyscallContext<'_, '_>, &[Val]) -> Result<Option<Val>> + Send + Sync;

/// One `env` import: its wasm signature and the host function behind it.
#[derive(Clone)]
pub struct Syscall {
    params: Vec<ValType>,
    results: Vec<ValType>,
    handler: Arc<HandlerFn>,
}

impl Syscall {
    /// A handler with an arbitrary signature.
    pub fn new<F>(params: Vec<ValType>, results: Vec<ValType>, handler: F) -> Self
    where
        F: Fn(&mut SyscallContext<'_, '_>, &[Val]) -> Result<Option<Val>> + Send + Sync + 'static,
    {
        Self {
            params,
            results,
            handler: Arc::new(handler),
        }
    }

    /// A handler taking `arity` i32 arguments and returning an i32, which is
    /// the shape of nearly every libc call on wasm32.
    pub fn i32<F>(arity: usize, handler: F) -> Self
    where
        F: Fn(&mut SyscallContext<'_, '_>, &[i32]) -> Result<i32> + Send + Sync + 'static,
    {
        Self::new(vec![ValType::I32; arity], vec![ValType::I32], move |cx, args| {
            let args: Vec<i32> = args.iter().map(|v| v.i32().unwrap_or_default()).collect();
            Ok(Some(Val::I32(handler(cx, &args)?)))
        })
    }

    /// Call the handler directly.
    pub fn call(&self, cx: &mut SyscallContext<'_, '_>, args: &[Val]) -> Result<Option<Val>> {
        (self.handler)(cx, args)
    }
}

impl fmt::Debug for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syscall")
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// The `env` import namespace, by function name.
#[derive(Debug, Clone, Default)]
pub struct ImportMap {
    entries: BTreeMap<String, Syscall>,
}

impl ImportMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an import.
    pub fn insert(&mut self, name: impl Into<String>, syscall: Syscall) -> Option<Syscall> {
        self.entries.insert(name.into(), syscall)
    }

    /// Add an import unless the name is already taken. Returns whether it
    /// was added.
    pub fn insert_missing(&mut self, name: impl Into<String>, syscall: Syscall) -> bool {
        match self.entries.entry(name.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(syscall);
                true
            }
        }
    }

    /// Whether `name` is defined.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Look up an import.
    pub fn get(&self, name: &str) -> Option<&Syscall> {
        self.entries.get(name)
    }

    /// Number of imports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Import names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Define every entry in the linker's `env` namespace. Each host function
    /// gets a context bound to `bridge`.
    pub(crate) fn define(
        self,
        linker: &mut Linker<HostState>,
        engine: &Engine,
        bridge: &Arc<SyscallBridge>,
    ) -> Result<()> {
        for (name, syscall) in self.entries {
            let ty = FuncType::new(engine, syscall.params, syscall.results);
            let handler = syscall.handler;
            let bridge = Arc::clone(bridge);
            let label = name.clone();
            linker
                .func_new(
                    ENV_MODULE,
                    &name,
                    ty,
                    move |mut caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
                        trace!("env.{}{:?}", label, params);
                        let mut cx = SyscallContext::new(&mut caller, &bridge);
                        let out = handler(&mut cx, params).map_err(|e| {
                            debug!("env.{} failed: {}", label, e);
                            e
                        })?;
                        if let (Some(slot), Some(value)) = (results.first_mut(), out) {
                            *slot = value;
                        }
                        Ok(())
                    },
                )
                .map_err(|e| WasmPosixError::Wasm(format!("failed to define env.{}: {}", name, e)))?;
        }
        Ok(())
    }
}

/// Host capabilities the bridge's handlers run against.
#[derive(Clone)]
pub struct Capabilities {
    bindings: Arc<dyn HostBindings>,
    cwd: Arc<dyn Fn() -> std::io::Result<String> + Send + Sync>,
    blocking: Option<BlockingClient>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            bindings: default_bindings(),
            cwd: Arc::new(|| {
                std::env::current_dir().map(|dir| dir.to_string_lossy().into_owned())
            }),
            blocking: None,
        }
    }
}

impl Capabilities {
    /// Replace the host bindings.
    pub fn with_bindings(mut self, bindings: Arc<dyn HostBindings>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Replace the working-directory accessor used by `getcwd`.
    pub fn with_cwd<F>(mut self, cwd: F) -> Self
    where
        F: Fn() -> std::io::Result<String> + Send + Sync + 'static,
    {
        self.cwd = Arc::new(cwd);
        self
    }

    /// Route blocking operations (sleep, stdin) through a worker's owner.
    pub fn with_blocking(mut self, client: BlockingClient) -> Self {
        self.blocking = Some(client);
        self
    }

    /// Host bindings.
    pub fn bindings(&self) -> &Arc<dyn HostBindings> {
        &self.bindings
    }

    /// Current working directory according to the accessor.
    pub fn cwd(&self) -> std::io::Result<String> {
        (self.cwd)()
    }

    /// The owner-side channel for blocking operations, on a worker.
    pub fn blocking(&self) -> Option<&BlockingClient> {
        self.blocking.as_ref()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("blocking", &self.blocking.is_some())
            .finish_non_exhaustive()
    }
}

/// Maps `env` syscall names to host handlers, bound late to one instance.
pub struct SyscallBridge {
    handlers: ImportMap,
    caps: Capabilities,
    handle: OnceLock<SandboxHandle>,
    constants: OnceLock<Constants>,
}

impl SyscallBridge {
    /// Build the bridge and its handlers. It is unusable until [`init`](Self::init).
    pub fn new(caps: Capabilities) -> Self {
        let mut handlers = ImportMap::new();
        unistd::register(&mut handlers);
        other::register(&mut handlers);
        io::register(&mut handlers);
        process::register(&mut handlers);

        Self {
            handlers,
            caps,
            handle: OnceLock::new(),
            constants: OnceLock::new(),
        }
    }

    /// Bind to the live instance and fetch its constants table.
    ///
    /// Binding happens once; a second call is `AlreadyBound`. A module
    /// without constants is accepted, errno values then pass through in
    /// host numbering.
    pub fn init<S>(&self, store: &mut S, handle: SandboxHandle) -> Result<()>
    where
        S: AsContextMut<Data = HostState>,
    {
        self.handle
            .set(handle)
            .map_err(|_| WasmPosixError::AlreadyBound)?;

        match Constants::fetch(&handle, store) {
            Ok(constants) => {
                debug!("bridge bound, {} constants", constants.len());
                let _ = self.constants.set(constants);
            }
            Err(WasmPosixError::NotFound(_)) | Err(WasmPosixError::NotAvailable(_)) => {
                debug!("bridge bound, sandbox has no constants table");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Merge the bridge's handlers into `imports`. Names already present
    /// are left alone, so caller-supplied handlers override the bridge's.
    pub fn inject_functions(&self, imports: &mut ImportMap) {
        for (name, syscall) in &self.handlers.entries {
            if !imports.insert_missing(name.as_str(), syscall.clone()) {
                debug!("env.{} supplied by caller", name);
            }
        }
    }

    /// Names of the handlers the bridge provides.
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.names()
    }

    /// The bound instance.
    pub fn handle(&self) -> Result<SandboxHandle> {
        self.handle.get().copied().ok_or(WasmPosixError::NotBound)
    }

    /// Whether [`init`](Self::init) has run.
    pub fn is_bound(&self) -> bool {
        self.handle.get().is_some()
    }

    /// Constants fetched at bind time, if the sandbox provided them.
    pub fn constants(&self) -> Option<&Constants> {
        self.constants.get()
    }

    /// Host capabilities.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }
}

impl fmt::Debug for SyscallBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallBridge")
            .field("handlers", &self.handlers.len())
            .field("bound", &self.is_bound())
            .field("constants", &self.constants.get().map(Constants::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: i32) -> Syscall {
        Syscall::i32(0, move |_, _| Ok(value))
    }

    #[test]
    fn test_insert_missing_keeps_existing() {
        let mut map = ImportMap::new();
        assert!(map.insert_missing("getpid", constant(1)));
        assert!(!map.insert_missing("getpid", constant(2)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_inject_never_overwrites() {
        let bridge = SyscallBridge::new(Capabilities::default());
        let custom = Syscall::new(vec![ValType::I64], vec![], |_, _| Ok(None));

        let mut imports = ImportMap::new();
        imports.insert("getpid", custom);
        bridge.inject_functions(&mut imports);

        // caller's signature survived
        let getpid = imports.get("getpid").unwrap();
        assert_eq!(getpid.params.len(), 1);
        assert!(getpid.results.is_empty());

        // everything else came from the bridge
        for name in bridge.handler_names() {
            assert!(imports.contains(name), "{} missing", name);
        }
    }

    #[test]
    fn test_bridge_handlers() {
        let bridge = SyscallBridge::new(Capabilities::default());
        let names: Vec<_> = bridge.handler_names().collect();
        for expected in [
            "getpid", "getppid", "getuid", "geteuid", "getgid", "getegid", "getpgid", "setsid",
            "kill", "isatty", "ctermid", "login_tty", "gethostname", "getcwd", "statvfs",
            "fstatvfs", "sleep", "usleep", "wasm_read_stdin", "system",
        ] {
            assert!(names.contains(&expected), "{} not registered", expected);
        }
    }

    #[test]
    fn test_unbound_bridge() {
        let bridge = SyscallBridge::new(Capabilities::default());
        assert!(!bridge.is_bound());
        assert!(matches!(bridge.handle(), Err(WasmPosixError::NotBound)));
        assert!(bridge.constants().is_none());
    }

    #[test]
    fn test_capabilities_cwd_override() {
        let caps = Capabilities::default().with_cwd(|| Ok("/sandbox".to_string()));
        assert_eq!(caps.cwd().unwrap(), "/sandbox");
        assert!(caps.blocking().is_none());
    }
}
