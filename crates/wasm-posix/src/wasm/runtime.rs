//! WASM runtime implementation using wasmtime.
//!
//! Uses wasmtime-wasi preview1 for the WASI surface; everything POSIX that
//! WASI lacks is supplied by the syscall bridge in the `env` namespace.

use super::callbacks;
use super::config::{RuntimeConfig, WasiCapabilities};
use super::instance::{ModuleInstance, SandboxHandle, MEMORY_EXPORT};
use crate::error::{Result, WasmPosixError};
use crate::posix::{Capabilities, ImportMap, PosixState, SyscallBridge, ENV_MODULE};

use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use wasmtime::*;

/// Host state for the WASM store.
pub struct HostState {
    preview1: wasmtime_wasi::preview1::WasiP1Ctx,
    limits: StoreLimits,
    pub(crate) call: super::instance::CallState,
    pub(crate) posix: PosixState,
    pub(crate) small_string_size: usize,
}

impl HostState {
    fn preview1(&mut self) -> &mut wasmtime_wasi::preview1::WasiP1Ctx {
        &mut self.preview1
    }
}

/// Compiles modules and instantiates them with the POSIX bridge attached.
pub struct WasmRuntime {
    engine: Engine,
    config: RuntimeConfig,
}

/// A compiled WebAssembly module.
#[derive(Debug)]
pub struct WasmModule {
    module: Module,
    name: String,
}

impl WasmRuntime {
    /// Create a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });
        engine_config.wasm_simd(config.enable_simd);
        // Shared memories have no `Memory` handle to marshal through.
        engine_config.wasm_threads(false);

        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                tracing::warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| WasmPosixError::Wasm(format!("engine creation failed: {}", e)))?;

        Ok(Self { engine, config })
    }

    /// Load a module (binary or text format) from a file.
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<WasmModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let module = Module::from_file(&self.engine, path)
            .map_err(|e| WasmPosixError::Wasm(format!("module load failed: {}", e)))?;

        Ok(WasmModule { module, name })
    }

    /// Load a module from bytes.
    pub fn load_module_bytes(&self, name: &str, bytes: &[u8]) -> Result<WasmModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| WasmPosixError::Wasm(format!("module creation failed: {}", e)))?;

        Ok(WasmModule {
            module,
            name: name.to_string(),
        })
    }

    /// Instantiate with default host capabilities and no extra imports.
    pub fn instantiate(&self, module: &WasmModule) -> Result<ModuleInstance> {
        self.instantiate_with(module, ImportMap::new(), Capabilities::default())
    }

    /// Instantiate a module.
    ///
    /// `imports` are caller-supplied `env` functions; they win over the
    /// bridge's handlers of the same name.
    pub fn instantiate_with(
        &self,
        module: &WasmModule,
        mut imports: ImportMap,
        capabilities: Capabilities,
    ) -> Result<ModuleInstance> {
        let host_state = self.build_host_state(&self.config.capabilities)?;
        let mut store = Store::new(&self.engine, host_state);

        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| WasmPosixError::Wasm(format!("fuel setup failed: {}", e)))?;
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
            .map_err(|e| WasmPosixError::Wasm(format!("WASI link failed: {}", e)))?;

        // Handlers have to exist as imports before there is an instance for
        // them to talk to; the bridge is bound to it below.
        let bridge = Arc::new(SyscallBridge::new(capabilities));
        callbacks::inject(&mut imports);
        bridge.inject_functions(&mut imports);
        debug!("linking {} env imports for {}", imports.len(), module.name);
        imports.define(&mut linker, &self.engine, &bridge)?;

        let memory = provide_memory(&mut store, &mut linker, &module.module)?;

        linker
            .define_unknown_imports_as_traps(&module.module)
            .map_err(|e| WasmPosixError::Wasm(format!("link failed: {}", e)))?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| WasmPosixError::Wasm(format!("instantiation failed: {}", e)))?;

        let handle = SandboxHandle::new(&mut store, instance, memory)?;
        bridge.init(&mut store, handle)?;

        Ok(ModuleInstance::new(store, handle, bridge, module.name.clone()))
    }

    /// Build host state from capabilities.
    fn build_host_state(&self, caps: &WasiCapabilities) -> Result<HostState> {
        let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

        if caps.stdin {
            builder.inherit_stdin();
        }
        if caps.stdout {
            builder.inherit_stdout();
        }
        if caps.stderr {
            builder.inherit_stderr();
        }

        for (key, value) in &caps.env_vars {
            builder.env(key, value);
        }

        builder.args(&caps.args);

        for dir in &caps.preopened_dirs_ro {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::READ,
                    wasmtime_wasi::FilePerms::READ,
                )
                .map_err(|e| {
                    WasmPosixError::Wasm(format!("failed to open dir {:?}: {}", dir, e))
                })?;
        }

        for dir in &caps.preopened_dirs_rw {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::all(),
                    wasmtime_wasi::FilePerms::all(),
                )
                .map_err(|e| {
                    WasmPosixError::Wasm(format!("failed to open dir {:?}: {}", dir, e))
                })?;
        }

        let preview1 = builder.build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory)
            .build();

        Ok(HostState {
            preview1,
            limits,
            call: Default::default(),
            posix: PosixState::default(),
            small_string_size: self.config.small_string_size,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Satisfy an `env.memory` import with a host-created memory of the
/// requested type.
fn provide_memory(
    store: &mut Store<HostState>,
    linker: &mut Linker<HostState>,
    module: &Module,
) -> Result<Option<Memory>> {
    for import in module.imports() {
        if import.module() != ENV_MODULE || import.name() != MEMORY_EXPORT {
            continue;
        }
        if let ExternType::Memory(ty) = import.ty() {
            let memory = Memory::new(&mut *store, ty)
                .map_err(|e| WasmPosixError::Wasm(format!("memory creation failed: {}", e)))?;
            linker
                .define(&*store, ENV_MODULE, MEMORY_EXPORT, memory)
                .map_err(|e| WasmPosixError::Wasm(format!("memory import failed: {}", e)))?;
            return Ok(Some(memory));
        }
    }
    Ok(None)
}

impl WasmModule {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }
}
