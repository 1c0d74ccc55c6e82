//! POSIX symbolic constants as compiled into the sandbox.
//!
//! The values are whatever the sandbox's libc was built with, which is not
//! necessarily what the host uses (WASI errno numbering differs from Linux,
//! for one). They are fetched once, at bind time, and never change after.

use nix::errno::Errno;
use serde::Deserialize;
use std::collections::HashMap;
use wasmtime::AsContextMut;

use crate::error::{Result, WasmPosixError};
use crate::wasm::{HostState, SandboxHandle};

/// Zero-argument export returning a pointer to the constants JSON.
pub const EXPORT: &str = "getConstants";

#[derive(Debug, Deserialize)]
struct Wire {
    names: Vec<String>,
    values: Vec<i32>,
}

/// Mapping from POSIX macro names to the sandbox's numeric values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constants {
    values: HashMap<String, i32>,
}

impl Constants {
    /// Ask the sandbox for its constants.
    ///
    /// A zero pointer means the module was built without them.
    pub fn fetch<S>(handle: &SandboxHandle, store: &mut S) -> Result<Self>
    where
        S: AsContextMut<Data = HostState>,
    {
        let func = handle
            .get_function(store, EXPORT)
            .ok_or_else(|| WasmPosixError::NotFound(EXPORT.to_string()))?;
        let ptr = match handle.call_raw(store, &func, &[])? {
            Some(val) => val.i32().unwrap_or(0),
            None => 0,
        };
        if ptr == 0 {
            return Err(WasmPosixError::NotAvailable(
                "sandbox returned no constants".to_string(),
            ));
        }
        let json = handle.read_string(&*store, ptr as u32)?;
        Self::from_json(&json)
    }

    /// Parse the `{names, values}` wire form.
    pub fn from_json(json: &str) -> Result<Self> {
        let wire: Wire = serde_json::from_str(json)?;
        if wire.names.len() != wire.values.len() {
            return Err(WasmPosixError::Protocol(format!(
                "constants: {} names but {} values",
                wire.names.len(),
                wire.values.len()
            )));
        }
        Ok(Self {
            values: wire.names.into_iter().zip(wire.values).collect(),
        })
    }

    /// Value of a constant by name.
    pub fn get(&self, name: &str) -> Option<i32> {
        self.values.get(name).copied()
    }

    /// Translate a host errno to the sandbox's numbering, by name.
    ///
    /// Falls back to the host value when the sandbox doesn't define it.
    pub fn errno(&self, errno: Errno) -> i32 {
        self.get(&format!("{:?}", errno)).unwrap_or(errno as i32)
    }

    /// Number of constants.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over `(name, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let c = Constants::from_json(r#"{"names":["EAGAIN","ENOENT"],"values":[6,44]}"#).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("EAGAIN"), Some(6));
        assert_eq!(c.get("ENOENT"), Some(44));
        assert_eq!(c.get("EPERM"), None);
    }

    #[test]
    fn test_length_mismatch() {
        let err = Constants::from_json(r#"{"names":["A","B"],"values":[1]}"#).unwrap_err();
        assert!(matches!(err, WasmPosixError::Protocol(_)));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            Constants::from_json("{names:"),
            Err(WasmPosixError::Json(_))
        ));
    }

    #[test]
    fn test_errno_by_name() {
        let c = Constants::from_json(r#"{"names":["ENOENT"],"values":[44]}"#).unwrap();
        assert_eq!(c.errno(Errno::ENOENT), 44);
        // not in the table: host value
        assert_eq!(c.errno(Errno::EPERM), Errno::EPERM as i32);
    }
}
