//! Integration tests for module instances: marshaling, symbol resolution,
//! the call contract and the dynamic load/execute primitive.
//!
//! Tests load tests/fixtures/libc.wat, a hand-written module that follows
//! the same conventions as a libc-linked sandbox.

use serde_json::json;
use wasm_posix::{
    Destination, ImportMap, ModuleInstance, RuntimeConfig, Syscall, WasmPosixError, WasmRuntime,
};

const LIBC_WAT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/libc.wat");
const MINIMAL_WAT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/minimal.wat");

fn instantiate(path: &str) -> ModuleInstance {
    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).expect("failed to create runtime");
    let module = runtime.load_module(path).expect("failed to load module");
    runtime.instantiate(&module).expect("failed to instantiate")
}

fn counter(instance: &mut ModuleInstance, name: &str) -> i64 {
    instance
        .call(name, &[])
        .expect("counter call failed")
        .as_i64()
        .expect("counter is a number")
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_add() {
    let mut instance = instantiate(MINIMAL_WAT);
    assert_eq!(instance.name(), "minimal");

    let output = instance.call("add", &[2, 3]).expect("add call failed");
    assert_eq!(output, json!(5));
    assert!(!instance.call_state().exception);

    let output = instance.call("add64", &[1 << 40, 1]).expect("add64 call failed");
    assert_eq!(output, json!((1i64 << 40) + 1));
}

#[test]
fn test_wrong_arity() {
    let mut instance = instantiate(MINIMAL_WAT);
    let err = instance.call("add", &[1]).unwrap_err();
    assert!(matches!(err, WasmPosixError::InvalidArgument(_)), "got {:?}", err);
}

#[test]
fn test_constants() {
    let instance = instantiate(LIBC_WAT);
    let constants = instance.constants().expect("constants should be loaded");

    let eagain = constants.get("EAGAIN").expect("EAGAIN missing");
    assert!((0..1000).contains(&eagain));

    let mut values: Vec<i32> = constants.iter().map(|(_, v)| v).collect();
    let total = values.len();
    values.sort_unstable();
    values.dedup();
    assert_eq!(values.len(), total, "constant values should be distinct");
}

#[test]
fn test_constants_not_available() {
    // getConstants returns 0: the module still loads
    let instance = instantiate(MINIMAL_WAT);
    assert!(instance.constants().is_none());
    assert!(instance.bridge().is_bound());
}

#[test]
fn test_indirect_resolution_wins() {
    let mut instance = instantiate(LIBC_WAT);

    // direct export `twice` returns -1; the forwarded one doubles
    let output = instance.call("twice", &[21]).expect("twice call failed");
    assert_eq!(output, json!(42));

    // no accessor: direct export
    assert!(instance.get_function("add").is_some());
    // neither tier
    assert!(instance.get_function("nonexistent").is_none());
    // accessor points outside the table
    assert!(instance.get_function("ghost").is_none());

    let err = instance.call("nonexistent", &[]).unwrap_err();
    assert!(matches!(err, WasmPosixError::NotFound(name) if name == "nonexistent"));
}

#[test]
fn test_send_string_into_destination() {
    let mut instance = instantiate(LIBC_WAT);
    let dest = Destination {
        ptr: 8192,
        capacity: 32,
    };

    let ptr = instance.send_string("hello", Some(dest)).expect("send_string failed");
    assert_eq!(ptr, 8192);
    let bytes = instance.read_memory(ptr, 6).expect("read_memory failed");
    assert_eq!(bytes, b"hello\0");

    // truncated to capacity - 1
    let dest = Destination {
        ptr: 8192,
        capacity: 4,
    };
    instance.send_string("truncated", Some(dest)).expect("send_string failed");
    assert_eq!(instance.read_string(8192).unwrap(), "tru");
    assert_eq!(counter(&mut instance, "mallocs"), 0, "destination writes never allocate");
}

#[test]
fn test_send_and_free() {
    let mut instance = instantiate(LIBC_WAT);
    let ptr = instance.send(&[1, 2, 3, 4]).expect("send failed");
    assert!(ptr >= 65536, "allocation should come from the heap");
    assert_eq!(instance.read_memory(ptr, 4).unwrap(), vec![1, 2, 3, 4]);

    let ptr = instance.send_string("abc", None).expect("send_string failed");
    assert_eq!(instance.read_string(ptr).unwrap(), "abc");
    instance.free(ptr).expect("free failed");
    assert_eq!(counter(&mut instance, "frees"), 1);
}

#[test]
fn test_out_of_memory() {
    let mut instance = instantiate(LIBC_WAT);
    let err = instance.send(&vec![0u8; 100_000]).unwrap_err();
    assert!(matches!(err, WasmPosixError::OutOfMemory(100_000)), "got {:?}", err);
}

#[test]
fn test_out_of_bounds() {
    let instance = instantiate(LIBC_WAT);
    let err = instance.read_memory(131_070, 8).unwrap_err();
    assert!(matches!(err, WasmPosixError::OutOfBounds { .. }));
}

#[test]
fn test_scratch_buffer_reused() {
    let mut instance = instantiate(LIBC_WAT);

    for word in ["one", "two", "three", "four", "five"] {
        let output = instance.call_with_string("echo", word, &[]).expect("echo failed");
        assert_eq!(output, json!(word));
    }
    assert_eq!(counter(&mut instance, "mallocs"), 1, "allocator hit once for the scratch buffer");
    assert_eq!(counter(&mut instance, "frees"), 0);
}

#[test]
fn test_long_string_released() {
    let mut instance = instantiate(LIBC_WAT);
    let long = "x".repeat(10_000);

    let output = instance.call_with_string("strlen", &long, &[]).expect("strlen failed");
    assert_eq!(output, json!(10_000));
    assert_eq!(counter(&mut instance, "mallocs"), 1);
    assert_eq!(counter(&mut instance, "frees"), 1);
}

#[test]
fn test_string_array_released() {
    let mut instance = instantiate(LIBC_WAT);
    let args = argv(&["ab", "cde"]);

    let output = instance.call_with_string("argv_total", &args, &[]).expect("argv_total failed");
    assert_eq!(output, json!(5));
    // two strings and the pointer array
    assert_eq!(counter(&mut instance, "frees"), 3);

    let empty: Vec<String> = Vec::new();
    let output = instance.call_with_string("argv_total", &empty, &[]).expect("argv_total failed");
    assert_eq!(output, json!(0));
}

#[test]
fn test_string_array_released_on_failure() {
    let mut instance = instantiate(LIBC_WAT);
    let args = argv(&["a", "b"]);

    // `terminal` takes (argc, argv); with an extra argument the call fails
    // before reaching the sandbox, after marshaling
    let err = instance.call_with_string("terminal", &args, &[1]).unwrap_err();
    assert!(matches!(err, WasmPosixError::InvalidArgument(_)));
    assert_eq!(counter(&mut instance, "frees"), 3);
}

#[test]
fn test_side_channel_results() {
    let mut instance = instantiate(LIBC_WAT);

    let output = instance.call("json_result", &[]).expect("json_result failed");
    assert_eq!(output, json!({"ok": true, "n": [1, 2]}));

    let output = instance.call("big", &[]).expect("big failed");
    assert_eq!(output, json!(1_099_511_627_776i64));

    // state is reset per call: plain return again
    let output = instance.call("add", &[1, 1]).expect("add failed");
    assert_eq!(output, json!(2));
    assert!(instance.call_state().result.is_none());
}

#[test]
fn test_exception_flag() {
    let mut instance = instantiate(LIBC_WAT);
    let err = instance.call("raise", &[]).unwrap_err();
    assert!(matches!(err, WasmPosixError::RuntimeError(name) if name == "raise"));
    assert!(instance.call_state().exception);
}

#[test]
fn test_malformed_json_result() {
    let mut instance = instantiate(LIBC_WAT);
    let err = instance.call("bad_json", &[]).unwrap_err();
    assert!(matches!(err, WasmPosixError::Json(_)), "got {:?}", err);
}

#[test]
fn test_c_define_and_terminal() {
    let mut instance = instantiate(LIBC_WAT);
    assert_eq!(instance.c_define("A_CONSTANT").expect("cDefine failed"), i64::from(b'A'));
    assert_eq!(instance.terminal(&argv(&["python", "-q"])).expect("terminal failed"), 2);
}

#[test]
fn test_run() {
    let mut instance = instantiate(LIBC_WAT);
    // 2 args, 7 + 2 bytes
    let code = instance.run(&argv(&["main.so", "ab"])).expect("run failed");
    assert_eq!(code, 209);
    assert_eq!(counter(&mut instance, "dlcloses"), 1);
}

#[test]
fn test_run_restores_memory() {
    let mut instance = instantiate(LIBC_WAT);
    // scratch allocated up front so only the run itself is measured
    instance.call_with_string("echo", "warm up", &[]).unwrap();

    let before = instance.memory_snapshot();
    for _ in 0..2 {
        let code = instance.run(&argv(&["main.so", "x"])).expect("run failed");
        assert_eq!(code, 208);
        assert_eq!(instance.memory_snapshot(), before);
    }

    // failure after the snapshot: memory still restored
    let err = instance.run(&argv(&["fail.so"])).unwrap_err();
    assert!(matches!(err, WasmPosixError::RuntimeError(_)));
    assert_eq!(instance.memory_snapshot(), before);

    // loader gap: exit code 1, memory restored, no dlclose
    let code = instance.run(&argv(&["other.so"])).expect("run failed");
    assert_eq!(code, 1);
    assert_eq!(instance.memory_snapshot(), before);
    assert_eq!(counter(&mut instance, "dlcloses"), 2);
}

#[test]
fn test_first_run_restores_memory() {
    // the allocator keeps its break in linear memory, so any allocation
    // made on behalf of the run shows up in the comparison
    let mut instance = instantiate(LIBC_WAT);
    let before = instance.memory_snapshot();
    let code = instance.run(&argv(&["main.so"])).expect("run failed");
    assert_eq!(code, 107);
    assert_eq!(instance.memory_snapshot(), before);
    assert!(counter(&mut instance, "mallocs") > 0);

    // the scratch buffer allocated inside the run was rolled back with it;
    // the next string call must not write through a stale pointer
    let output = instance.call_with_string("echo", "after", &[]).expect("echo failed");
    assert_eq!(output, json!("after"));
    let before = instance.memory_snapshot();
    instance.run(&argv(&["main.so"])).expect("run failed");
    assert_eq!(instance.memory_snapshot(), before);
}

#[test]
fn test_run_empty_argv() {
    let mut instance = instantiate(LIBC_WAT);
    let err = instance.run(&[]).unwrap_err();
    assert!(matches!(err, WasmPosixError::InvalidArgument(_)));
}

#[test]
fn test_run_without_dlsym() {
    let wat = r#"
    (module
      (memory (export "memory") 1)
      (global $heap (mut i32) (i32.const 1024))
      (func (export "c_malloc") (param i32) (result i32) (local $p i32)
        (local.set $p (global.get $heap))
        (global.set $heap (i32.add (local.get $p) (local.get 0)))
        (local.get $p))
      (func (export "c_free") (param i32))
      (func (export "dlopen") (param i32) (result i32) (i32.const 1)))
    "#;
    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).unwrap();
    let module = runtime.load_module_bytes("loader", wat.as_bytes()).unwrap();
    let mut instance = runtime.instantiate(&module).unwrap();

    let code = instance.run(&argv(&["ls.so"])).expect("run failed");
    assert_eq!(code, 1);
}

#[test]
fn test_imported_memory() {
    let wat = r#"
    (module
      (import "env" "memory" (memory 1))
      (func (export "peek") (param i32) (result i32)
        (i32.load8_u (local.get 0))))
    "#;
    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).unwrap();
    let module = runtime.load_module_bytes("imported", wat.as_bytes()).unwrap();
    let mut instance = runtime.instantiate(&module).unwrap();

    instance.write_memory(100, b"A").unwrap();
    assert_eq!(instance.call("peek", &[100]).unwrap(), json!(65));
}

#[test]
fn test_caller_imports_win() {
    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).unwrap();
    let module = runtime.load_module(LIBC_WAT).unwrap();

    let mut imports = ImportMap::new();
    imports.insert("getpid", Syscall::i32(0, |_, _| Ok(7)));
    let mut instance = runtime
        .instantiate_with(&module, imports, Default::default())
        .unwrap();

    assert_eq!(instance.call("call_getpid", &[]).unwrap(), json!(7));
}

#[test]
fn test_fuel_metering() {
    let runtime = WasmRuntime::new(RuntimeConfig::default().fuel_limit(1_000_000)).unwrap();
    let module = runtime.load_module(MINIMAL_WAT).unwrap();
    let mut instance = runtime.instantiate(&module).unwrap();

    let initial = instance.remaining_fuel().expect("fuel should be available");
    instance.call("add", &[1, 2]).unwrap();
    let remaining = instance.remaining_fuel().expect("fuel should be available");
    assert!(remaining < initial, "fuel should have been consumed");
}
