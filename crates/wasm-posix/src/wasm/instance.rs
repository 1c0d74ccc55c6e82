//! Module instances, symbol resolution and the call contract.
//!
//! A [`SandboxHandle`] is the copyable set of handles (instance, linear
//! memory, optional call table) that every layer uses to reach into a
//! sandbox. Its methods are generic over the store context so the same code
//! runs from the owning [`ModuleInstance`] and from inside a host function
//! (through its `Caller`).
//!
//! ## Call contract
//!
//! The call boundary only carries numbers. Sandbox code that wants to return
//! anything richer (or to signal an exception) calls one of the `wasm_set_*`
//! imports before returning; the host then prefers that side channel over
//! the raw numeric return.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use wasmtime::{AsContextMut, Func, FuncType, Instance, Memory, Ref, Store, Table, Val, ValType};

use super::marshal::StringArg;
use super::runtime::HostState;
use crate::error::{Result, WasmPosixError};
use crate::posix::{Constants, SyscallBridge};

/// Linear memory export name.
pub const MEMORY_EXPORT: &str = "memory";

/// Indirect call table export name.
pub const TABLE_EXPORT: &str = "__indirect_function_table";

/// Prefix of the accessor exports that return a call-table index for a
/// dynamically relinked symbol.
pub const FORWARD_PREFIX: &str = "__WASM_EXPORT__";

/// State shared between the host and sandbox-side callbacks for the call in
/// flight. Only one call per instance may be in flight.
#[derive(Debug, Default)]
pub struct CallState {
    /// Result set by `wasm_set_int`/`wasm_set_string`/`wasm_set_json`
    pub result: Option<Value>,
    /// Set by `wasm_set_exception`
    pub exception: bool,
    pub(crate) scratch: Option<u32>,
}

impl CallState {
    fn reset(&mut self) {
        self.result = None;
        self.exception = false;
    }
}

/// Handles into a live sandbox: instance, memory and optional call table.
#[derive(Debug, Clone, Copy)]
pub struct SandboxHandle {
    instance: Instance,
    memory: Memory,
    table: Option<Table>,
}

impl SandboxHandle {
    pub(crate) fn new<S>(store: &mut S, instance: Instance, memory: Option<Memory>) -> Result<Self>
    where
        S: AsContextMut<Data = HostState>,
    {
        let memory = match memory {
            Some(memory) => memory,
            None => instance
                .get_memory(&mut *store, MEMORY_EXPORT)
                .ok_or_else(|| WasmPosixError::Wasm("no memory export found".to_string()))?,
        };
        let table = instance.get_table(&mut *store, TABLE_EXPORT);
        Ok(Self {
            instance,
            memory,
            table,
        })
    }

    /// The sandbox's linear memory.
    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Whether the instance exposes an indirect call table.
    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    /// Resolve a callable by name.
    ///
    /// With a call table present, a `__WASM_EXPORT__<name>` accessor takes
    /// priority over a same-named export, since relinked symbols can move.
    /// Returns `None` when neither tier knows the name.
    pub fn get_function<S>(&self, store: &mut S, name: &str) -> Option<Func>
    where
        S: AsContextMut<Data = HostState>,
    {
        if self.table.is_some() {
            let accessor = format!("{}{}", FORWARD_PREFIX, name);
            if let Some(get_ptr) = self.instance.get_func(&mut *store, &accessor) {
                return match self.call_raw(store, &get_ptr, &[]) {
                    Ok(Some(Val::I32(index))) => self.table_function(store, index as u32),
                    Ok(other) => {
                        warn!("{} returned {:?}, expected a table index", accessor, other);
                        None
                    }
                    Err(e) => {
                        warn!("{} failed: {}", accessor, e);
                        None
                    }
                };
            }
        }
        self.instance.get_func(&mut *store, name)
    }

    /// Look up a function in the call table by index (a function pointer).
    pub fn table_function<S>(&self, store: &mut S, index: u32) -> Option<Func>
    where
        S: AsContextMut<Data = HostState>,
    {
        let table = self.table?;
        match table.get(&mut *store, index.try_into().ok()?) {
            Some(Ref::Func(Some(func))) => Some(func),
            _ => None,
        }
    }

    /// Call without touching the call state. Used for allocator traffic and
    /// accessor lookups, which must not clobber a result in flight.
    pub(crate) fn call_raw<S>(&self, store: &mut S, func: &Func, params: &[Val]) -> Result<Option<Val>>
    where
        S: AsContextMut<Data = HostState>,
    {
        let ty = func.ty(&*store);
        let mut results: Vec<Val> = ty.results().map(|t| placeholder(&t)).collect();
        func.call(&mut *store, params, &mut results)
            .map_err(WasmPosixError::from_call)?;
        Ok(results.into_iter().next())
    }

    /// Call under the full contract: reset the call state, call, then let an
    /// exception flag fail the call and a side-channel result win over the
    /// raw return.
    pub(crate) fn invoke<S>(&self, store: &mut S, name: &str, func: &Func, params: &[Val]) -> Result<Value>
    where
        S: AsContextMut<Data = HostState>,
    {
        store.as_context_mut().data_mut().call.reset();

        let raw = self.call_raw(store, func, params)?;

        let mut cx = store.as_context_mut();
        let state = &cx.data_mut().call;
        if state.exception {
            return Err(WasmPosixError::RuntimeError(name.to_string()));
        }
        Ok(match &state.result {
            Some(value) => value.clone(),
            None => val_to_json(raw),
        })
    }

    /// Call `name` with numeric arguments converted to its parameter types.
    pub fn call<S>(&self, store: &mut S, name: &str, args: &[i64]) -> Result<Value>
    where
        S: AsContextMut<Data = HostState>,
    {
        let func = self
            .get_function(store, name)
            .ok_or_else(|| WasmPosixError::NotFound(name.to_string()))?;
        let params = params_for(&func.ty(&*store), &[], args)?;
        self.invoke(store, name, &func, &params)
    }

    /// Bounds-checked read of linear memory.
    pub fn read_memory<S>(&self, store: &S, ptr: u32, len: usize) -> Result<Vec<u8>>
    where
        S: AsContextMut<Data = HostState>,
    {
        let data = self.memory.data(store);
        let start = ptr as usize;
        match start.checked_add(len) {
            Some(end) if end <= data.len() => Ok(data[start..end].to_vec()),
            _ => Err(WasmPosixError::OutOfBounds { ptr: start, len }),
        }
    }

    /// Bounds-checked write into linear memory.
    pub fn write_memory<S>(&self, store: &mut S, ptr: u32, bytes: &[u8]) -> Result<()>
    where
        S: AsContextMut<Data = HostState>,
    {
        let data = self.memory.data_mut(&mut *store);
        let start = ptr as usize;
        match start.checked_add(bytes.len()) {
            Some(end) if end <= data.len() => {
                data[start..end].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(WasmPosixError::OutOfBounds {
                ptr: start,
                len: bytes.len(),
            }),
        }
    }

    /// Read a NUL-terminated string starting at `ptr`.
    pub fn read_string<S>(&self, store: &S, ptr: u32) -> Result<String>
    where
        S: AsContextMut<Data = HostState>,
    {
        let data = self.memory.data(store);
        let start = ptr as usize;
        let tail = data.get(start..).ok_or(WasmPosixError::OutOfBounds { ptr: start, len: 1 })?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(WasmPosixError::OutOfBounds {
                ptr: start,
                len: tail.len(),
            })?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    /// Private byte-for-byte copy of linear memory.
    pub fn snapshot<S>(&self, store: &S) -> Vec<u8>
    where
        S: AsContextMut<Data = HostState>,
    {
        self.memory.data(store).to_vec()
    }

    /// Put a snapshot back. Memory cannot shrink, so pages grown since the
    /// snapshot are zeroed instead.
    pub fn restore<S>(&self, store: &mut S, snapshot: &[u8])
    where
        S: AsContextMut<Data = HostState>,
    {
        let data = self.memory.data_mut(&mut *store);
        let keep = snapshot.len().min(data.len());
        let (head, tail) = data.split_at_mut(keep);
        head.copy_from_slice(&snapshot[..keep]);
        tail.fill(0);
    }
}

/// Build call parameters: leading pointer arguments first, then `extra`,
/// each converted to the declared parameter type.
pub(crate) fn params_for(ty: &FuncType, leading: &[i32], extra: &[i64]) -> Result<Vec<Val>> {
    let expected = ty.params().len();
    let given = leading.len() + extra.len();
    if expected != given {
        return Err(WasmPosixError::InvalidArgument(format!(
            "function takes {} arguments, {} given",
            expected, given
        )));
    }
    let args = leading.iter().map(|&p| i64::from(p)).chain(extra.iter().copied());
    ty.params()
        .zip(args)
        .map(|(ty, arg)| match ty {
            ValType::I32 => Ok(Val::I32(arg as i32)),
            ValType::I64 => Ok(Val::I64(arg)),
            ValType::F32 => Ok(Val::F32((arg as f32).to_bits())),
            ValType::F64 => Ok(Val::F64((arg as f64).to_bits())),
            other => Err(WasmPosixError::InvalidArgument(format!(
                "unsupported parameter type {}",
                other
            ))),
        })
        .collect()
}

fn placeholder(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        _ => Val::I32(0),
    }
}

fn val_to_json(val: Option<Val>) -> Value {
    match val {
        Some(Val::I32(v)) => Value::from(v),
        Some(Val::I64(v)) => Value::from(v),
        Some(Val::F32(bits)) => Value::from(f64::from(f32::from_bits(bits))),
        Some(Val::F64(bits)) => Value::from(f64::from_bits(bits)),
        _ => Value::Null,
    }
}

/// Interpret a call output as a 32-bit sandbox value (pointer or handle).
pub(crate) fn as_i32(value: &Value, what: &str) -> Result<i32> {
    value
        .as_i64()
        .map(|v| v as i32)
        .ok_or_else(|| WasmPosixError::InvalidArgument(format!("{} returned {}, expected a number", what, value)))
}

/// A loaded sandbox module bound to its syscall bridge.
pub struct ModuleInstance {
    store: Store<HostState>,
    handle: SandboxHandle,
    bridge: Arc<SyscallBridge>,
    name: String,
}

impl ModuleInstance {
    pub(crate) fn new(
        store: Store<HostState>,
        handle: SandboxHandle,
        bridge: Arc<SyscallBridge>,
        name: String,
    ) -> Self {
        Self {
            store,
            handle,
            bridge,
            name,
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sandbox handles for this instance.
    pub fn handle(&self) -> SandboxHandle {
        self.handle
    }

    /// The syscall bridge serving this instance's imports.
    pub fn bridge(&self) -> &Arc<SyscallBridge> {
        &self.bridge
    }

    /// The underlying store.
    pub fn store_mut(&mut self) -> &mut Store<HostState> {
        &mut self.store
    }

    /// Call state left behind by the most recent call.
    pub fn call_state(&self) -> &CallState {
        &self.store.data().call
    }

    /// Last POSIX error recorded by a syscall handler, in sandbox numbering.
    pub fn last_errno(&self) -> i32 {
        self.store.data().posix.last_errno
    }

    /// Constants table fetched from the sandbox at bind time.
    pub fn constants(&self) -> Option<&Constants> {
        self.bridge.constants()
    }

    /// Fuel left, when fuel metering is enabled.
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    /// See [`SandboxHandle::get_function`].
    pub fn get_function(&mut self, name: &str) -> Option<Func> {
        self.handle.get_function(&mut self.store, name)
    }

    /// Call `name` with numeric arguments.
    pub fn call(&mut self, name: &str, args: &[i64]) -> Result<Value> {
        self.handle.call(&mut self.store, name, args)
    }

    /// Call `name` with a string (or `argc, argv` for a list) followed by
    /// numeric arguments.
    pub fn call_with_string<'a>(
        &mut self,
        name: &str,
        arg: impl Into<StringArg<'a>>,
        extra: &[i64],
    ) -> Result<Value> {
        self.handle
            .call_with_string(&mut self.store, name, arg.into(), extra)
    }

    /// Copy bytes into a fresh sandbox allocation.
    pub fn send(&mut self, bytes: &[u8]) -> Result<u32> {
        self.handle.send(&mut self.store, bytes)
    }

    /// Copy a NUL-terminated string into the sandbox. See
    /// [`SandboxHandle::send_string`].
    pub fn send_string(&mut self, text: &str, dest: Option<super::Destination>) -> Result<u32> {
        self.handle.send_string(&mut self.store, text, dest)
    }

    /// Release a sandbox allocation.
    pub fn free(&mut self, ptr: u32) -> Result<()> {
        self.handle.free(&mut self.store, ptr)
    }

    /// Read a NUL-terminated string from linear memory.
    pub fn read_string(&self, ptr: u32) -> Result<String> {
        self.handle.read_string(&self.store, ptr)
    }

    /// Read bytes from linear memory.
    pub fn read_memory(&self, ptr: u32, len: usize) -> Result<Vec<u8>> {
        self.handle.read_memory(&self.store, ptr, len)
    }

    /// Write bytes to linear memory.
    pub fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        self.handle.write_memory(&mut self.store, ptr, bytes)
    }

    /// Copy of the whole linear memory.
    pub fn memory_snapshot(&self) -> Vec<u8> {
        self.handle.snapshot(&self.store)
    }

    /// Load `argv[0]` as a library, run its entry point and roll memory
    /// back. See [`SandboxHandle::run`].
    pub fn run(&mut self, argv: &[String]) -> Result<i32> {
        self.handle.run(&mut self.store, argv)
    }

    /// Start the module's interactive terminal entry point.
    pub fn terminal(&mut self, argv: &[String]) -> Result<i32> {
        let output = self.call_with_string("terminal", argv, &[])?;
        as_i32(&output, "terminal")
    }

    /// Ask the sandbox for the value of one C preprocessor constant.
    pub fn c_define(&mut self, name: &str) -> Result<i64> {
        let output = self.call_with_string("cDefine", name, &[])?;
        output
            .as_i64()
            .ok_or_else(|| WasmPosixError::InvalidArgument(format!("cDefine({}) returned {}", name, output)))
    }
}
