//! Moving strings and buffers across the linear-memory boundary.
//!
//! Allocation goes through the sandbox's own allocator exports (`c_malloc`,
//! `c_free`). A null pointer from the allocator is always an error: writing
//! through it would corrupt the bottom of linear memory.

use serde_json::Value;
use tracing::trace;
use wasmtime::{AsContextMut, Val};

use super::instance::{params_for, SandboxHandle};
use super::runtime::HostState;
use crate::error::{Result, WasmPosixError};

/// Allocator export.
pub const MALLOC: &str = "c_malloc";

/// Deallocator export.
pub const FREE: &str = "c_free";

/// `sizeof(char*)` in the sandbox (wasm32).
pub const POINTER_SIZE: usize = 4;

/// A fixed-size slot in sandbox memory to write a string into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// Start of the slot
    pub ptr: u32,
    /// Slot size in bytes, including room for the NUL
    pub capacity: usize,
}

/// String argument for [`SandboxHandle::call_with_string`].
#[derive(Debug, Clone, Copy)]
pub enum StringArg<'a> {
    /// Passed as a single `char*`
    One(&'a str),
    /// Passed as `argc, char**`
    Many(&'a [String]),
}

impl<'a> From<&'a str> for StringArg<'a> {
    fn from(s: &'a str) -> Self {
        StringArg::One(s)
    }
}

impl<'a> From<&'a String> for StringArg<'a> {
    fn from(s: &'a String) -> Self {
        StringArg::One(s)
    }
}

impl<'a> From<&'a [String]> for StringArg<'a> {
    fn from(list: &'a [String]) -> Self {
        StringArg::Many(list)
    }
}

impl<'a> From<&'a Vec<String>> for StringArg<'a> {
    fn from(list: &'a Vec<String>) -> Self {
        StringArg::Many(list)
    }
}

/// Sandbox allocations owned by one host-side operation.
#[derive(Debug, Default)]
pub(crate) struct Allocations {
    ptrs: Vec<u32>,
}

impl Allocations {
    pub(crate) fn track(&mut self, ptr: u32) -> u32 {
        self.ptrs.push(ptr);
        ptr
    }

    /// Free everything, newest first. Every pointer is attempted; the first
    /// failure is reported.
    fn release<S>(self, handle: &SandboxHandle, store: &mut S) -> Result<()>
    where
        S: AsContextMut<Data = HostState>,
    {
        let mut first_err = None;
        for ptr in self.ptrs.into_iter().rev() {
            if let Err(e) = handle.free(store, ptr) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl SandboxHandle {
    /// Allocate `size` bytes with the sandbox allocator.
    pub fn malloc<S>(&self, store: &mut S, size: usize) -> Result<u32>
    where
        S: AsContextMut<Data = HostState>,
    {
        let func = self
            .get_function(store, MALLOC)
            .ok_or_else(|| WasmPosixError::NotFound(MALLOC.to_string()))?;
        let request = i32::try_from(size).map_err(|_| WasmPosixError::OutOfMemory(size))?;
        let ptr = match self.call_raw(store, &func, &[Val::I32(request)])? {
            Some(Val::I32(ptr)) => ptr as u32,
            _ => 0,
        };
        if ptr == 0 {
            return Err(WasmPosixError::OutOfMemory(size));
        }
        trace!("c_malloc({}) = {:#x}", size, ptr);
        Ok(ptr)
    }

    /// Release memory obtained from [`malloc`](Self::malloc).
    pub fn free<S>(&self, store: &mut S, ptr: u32) -> Result<()>
    where
        S: AsContextMut<Data = HostState>,
    {
        let func = self
            .get_function(store, FREE)
            .ok_or_else(|| WasmPosixError::NotFound(FREE.to_string()))?;
        self.call_raw(store, &func, &[Val::I32(ptr as i32)])?;
        Ok(())
    }

    /// Allocate `bytes.len()` bytes in the sandbox heap and copy `bytes` in.
    pub fn send<S>(&self, store: &mut S, bytes: &[u8]) -> Result<u32>
    where
        S: AsContextMut<Data = HostState>,
    {
        let ptr = self.malloc(store, bytes.len())?;
        if let Err(e) = self.write_memory(store, ptr, bytes) {
            let _ = self.free(store, ptr);
            return Err(e);
        }
        Ok(ptr)
    }

    /// Copy `text` into the sandbox as a NUL-terminated UTF-8 string.
    ///
    /// With a destination the string is truncated (on a character boundary)
    /// to `capacity - 1` bytes and written in place without allocating.
    /// Otherwise a fresh allocation is returned, which the caller frees.
    pub fn send_string<S>(&self, store: &mut S, text: &str, dest: Option<Destination>) -> Result<u32>
    where
        S: AsContextMut<Data = HostState>,
    {
        match dest {
            Some(dest) => {
                if dest.capacity == 0 {
                    return Err(WasmPosixError::InvalidArgument(
                        "destination has no room for the terminating NUL".to_string(),
                    ));
                }
                let text = truncate_utf8(text, dest.capacity - 1);
                self.write_cstring(store, dest.ptr, text)?;
                Ok(dest.ptr)
            }
            None => {
                let mut bytes = Vec::with_capacity(text.len() + 1);
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(0);
                self.send(store, &bytes)
            }
        }
    }

    fn write_cstring<S>(&self, store: &mut S, ptr: u32, text: &str) -> Result<()>
    where
        S: AsContextMut<Data = HostState>,
    {
        self.write_memory(store, ptr, text.as_bytes())?;
        self.write_memory(store, ptr + text.len() as u32, &[0])
    }

    /// The reused scratch buffer for short strings, allocated on first use.
    /// Its pointer is only meaningful for the call that is about to happen.
    pub(crate) fn scratch<S>(&self, store: &mut S) -> Result<u32>
    where
        S: AsContextMut<Data = HostState>,
    {
        if let Some(ptr) = store.as_context_mut().data().call.scratch {
            return Ok(ptr);
        }
        let size = store.as_context_mut().data().small_string_size;
        let ptr = self.malloc(store, size)?;
        store.as_context_mut().data_mut().call.scratch = Some(ptr);
        Ok(ptr)
    }

    /// Marshal a list of strings as a `char**`, tracking every allocation.
    /// An empty list is passed as a null pointer.
    pub(crate) fn send_strings<S>(
        &self,
        store: &mut S,
        strings: &[String],
        allocs: &mut Allocations,
    ) -> Result<u32>
    where
        S: AsContextMut<Data = HostState>,
    {
        if strings.is_empty() {
            return Ok(0);
        }
        let mut index = Vec::with_capacity(strings.len() * POINTER_SIZE);
        for s in strings {
            let ptr = allocs.track(self.send_string(store, s, None)?);
            index.extend_from_slice(&ptr.to_le_bytes());
        }
        Ok(allocs.track(self.send(store, &index)?))
    }

    /// Run `body` with an allocation scope; everything it tracks is freed on
    /// every exit path. The body's own error takes precedence.
    pub(crate) fn scoped<S, T, F>(&self, store: &mut S, body: F) -> Result<T>
    where
        S: AsContextMut<Data = HostState>,
        F: FnOnce(&mut S, &mut Allocations) -> Result<T>,
    {
        let mut allocs = Allocations::default();
        let outcome = body(store, &mut allocs);
        let released = allocs.release(self, store);
        let value = outcome?;
        released?;
        Ok(value)
    }

    /// Call `name` with a string argument followed by `extra`.
    ///
    /// A single string shorter than the scratch size goes through the
    /// reused scratch buffer. Longer strings get their own allocation, and a
    /// list is passed as `argc, argv`; those allocations are released
    /// however the call ends.
    pub fn call_with_string<S>(
        &self,
        store: &mut S,
        name: &str,
        arg: StringArg<'_>,
        extra: &[i64],
    ) -> Result<Value>
    where
        S: AsContextMut<Data = HostState>,
    {
        let func = self
            .get_function(store, name)
            .ok_or_else(|| WasmPosixError::NotFound(name.to_string()))?;
        let small = store.as_context_mut().data().small_string_size;

        match arg {
            StringArg::One(text) if text.len() < small => {
                let ptr = self.scratch(store)?;
                self.write_cstring(store, ptr, text)?;
                let params = params_for(&func.ty(&*store), &[ptr as i32], extra)?;
                self.invoke(store, name, &func, &params)
            }
            StringArg::One(text) => self.scoped(store, |store, allocs| {
                let ptr = allocs.track(self.send_string(store, text, None)?);
                let params = params_for(&func.ty(&*store), &[ptr as i32], extra)?;
                self.invoke(store, name, &func, &params)
            }),
            StringArg::Many(strings) => self.scoped(store, |store, allocs| {
                let argv = self.send_strings(store, strings, allocs)?;
                let params = params_for(
                    &func.ty(&*store),
                    &[strings.len() as i32, argv as i32],
                    extra,
                )?;
                self.invoke(store, name, &func, &params)
            }),
        }
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
