//! `env` imports through which sandbox code sets the call state.

use serde_json::Value;
use wasmtime::ValType;

use crate::error::Result;
use crate::posix::{ImportMap, Syscall, SyscallContext};

/// Add the `wasm_set_*` callbacks unless the caller supplied their own.
pub(crate) fn inject(imports: &mut ImportMap) {
    imports.insert_missing(
        "wasm_set_exception",
        Syscall::new(vec![], vec![], |cx, _| {
            cx.data_mut().call.exception = true;
            Ok(None)
        }),
    );
    imports.insert_missing(
        "wasm_set_int",
        Syscall::new(vec![ValType::I64], vec![], |cx, args| {
            let value = args.first().and_then(|v| v.i64()).unwrap_or_default();
            cx.data_mut().call.result = Some(Value::from(value));
            Ok(None)
        }),
    );
    imports.insert_missing(
        "wasm_set_string",
        Syscall::new(vec![ValType::I32, ValType::I32], vec![], |cx, args| {
            let bytes = read_slice(cx, args)?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            cx.data_mut().call.result = Some(Value::String(text));
            Ok(None)
        }),
    );
    imports.insert_missing(
        "wasm_set_json",
        Syscall::new(vec![ValType::I32, ValType::I32], vec![], |cx, args| {
            let bytes = read_slice(cx, args)?;
            let value: Value = serde_json::from_slice(&bytes)?;
            cx.data_mut().call.result = Some(value);
            Ok(None)
        }),
    );
}

fn read_slice(cx: &mut SyscallContext<'_, '_>, args: &[wasmtime::Val]) -> Result<Vec<u8>> {
    let ptr = args.first().and_then(|v| v.i32()).unwrap_or_default();
    let len = args.get(1).and_then(|v| v.i32()).unwrap_or_default();
    cx.read_memory(ptr as u32, len.max(0) as usize)
}
