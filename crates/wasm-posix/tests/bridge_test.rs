//! Integration tests for the POSIX syscall bridge, driving the `call_*`
//! exports of tests/fixtures/libc.wat against fake host bindings.

use std::sync::Arc;

use nix::errno::Errno;
use serde_json::json;
use wasm_posix::posix::{HostError, HostResult, NoBindings};
use wasm_posix::{
    Capabilities, HostBindings, ImportMap, ModuleInstance, RuntimeConfig, WasmPosixError,
    WasmRuntime,
};

const LIBC_WAT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/libc.wat");

/// A host with fixed answers and no terminal control.
struct FakeHost;

impl HostBindings for FakeHost {
    fn getpid(&self) -> HostResult<i32> {
        Ok(4242)
    }

    fn getpgid(&self, _pid: i32) -> HostResult<i32> {
        Err(HostError::Os(Errno::ESRCH))
    }

    fn gethostname(&self) -> HostResult<String> {
        Ok("sandbox-host".to_string())
    }

    fn isatty(&self, fd: i32) -> HostResult<bool> {
        Ok(fd == 0)
    }

    fn ctermid(&self) -> HostResult<String> {
        Ok("/dev/tty".to_string())
    }

    fn read_stdin(&self, buf: &mut [u8]) -> HostResult<usize> {
        let input = b"typed\n";
        let n = input.len().min(buf.len());
        buf[..n].copy_from_slice(&input[..n]);
        Ok(n)
    }

    fn sleep(&self, _duration: std::time::Duration) -> HostResult<()> {
        Ok(())
    }
}

fn instantiate_with(bindings: Arc<dyn HostBindings>) -> ModuleInstance {
    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).expect("failed to create runtime");
    let module = runtime.load_module(LIBC_WAT).expect("failed to load module");
    let caps = Capabilities::default()
        .with_bindings(bindings)
        .with_cwd(|| Ok("/home/sandbox".to_string()));
    runtime
        .instantiate_with(&module, ImportMap::new(), caps)
        .expect("failed to instantiate")
}

fn instantiate() -> ModuleInstance {
    instantiate_with(Arc::new(FakeHost))
}

fn call_i32(instance: &mut ModuleInstance, name: &str, args: &[i64]) -> i64 {
    instance
        .call(name, args)
        .expect("call failed")
        .as_i64()
        .expect("numeric result")
}

#[test]
fn test_getpid() {
    let mut instance = instantiate();
    assert_eq!(call_i32(&mut instance, "call_getpid", &[]), 4242);
}

#[test]
fn test_errno_translated_by_name() {
    let mut instance = instantiate();
    assert_eq!(call_i32(&mut instance, "call_getpgid", &[1]), -1);

    // ESRCH is 3 on Linux; the sandbox says 71
    assert_eq!(instance.last_errno(), 71);
    assert_eq!(call_i32(&mut instance, "errno", &[]), 71);
}

#[test]
fn test_getcwd() {
    let mut instance = instantiate();

    assert_eq!(call_i32(&mut instance, "call_getcwd", &[64]), 4096);
    assert_eq!(instance.read_string(4096).unwrap(), "/home/sandbox");

    // "/home/sandbox" plus NUL needs 14 bytes
    assert_eq!(call_i32(&mut instance, "call_getcwd", &[13]), 0);
    assert_eq!(instance.last_errno(), 68); // ERANGE

    let ptr = call_i32(&mut instance, "call_getcwd_alloc", &[]);
    assert!(ptr >= 65536);
    assert_eq!(instance.read_string(ptr as u32).unwrap(), "/home/sandbox");
}

#[test]
fn test_gethostname() {
    let mut instance = instantiate();

    assert_eq!(call_i32(&mut instance, "call_gethostname", &[64]), 0);
    assert_eq!(instance.read_string(3584).unwrap(), "sandbox-host");

    assert_eq!(call_i32(&mut instance, "call_gethostname", &[4]), -1);
    assert_eq!(instance.last_errno(), 37); // ENAMETOOLONG
}

#[test]
fn test_isatty() {
    let mut instance = instantiate();
    assert_eq!(call_i32(&mut instance, "call_isatty", &[0]), 1);
    assert_eq!(call_i32(&mut instance, "call_isatty", &[1]), 0);
    assert_eq!(instance.last_errno(), 59); // ENOTTY
}

#[test]
fn test_ctermid() {
    let mut instance = instantiate();

    // without a buffer: one cached allocation
    let first = call_i32(&mut instance, "call_ctermid", &[0]);
    let second = call_i32(&mut instance, "call_ctermid", &[0]);
    assert_ne!(first, 0);
    assert_eq!(first, second);
    assert_eq!(instance.read_string(first as u32).unwrap(), "/dev/tty");

    // into the caller's buffer
    assert_eq!(call_i32(&mut instance, "call_ctermid", &[512]), 512);
    assert_eq!(instance.read_string(512).unwrap(), "/dev/tty");
}

#[test]
fn test_ctermid_cached_inside_system_is_dropped() {
    let mut instance = instantiate();

    // "tty.so" calls ctermid(NULL) from its main
    let inner = instance
        .call_with_string("call_system", "tty.so", &[])
        .expect("system failed")
        .as_i64()
        .expect("numeric result");
    assert_ne!(inner, 0);

    // that block was rolled back with the rest of the run's memory
    let outer = call_i32(&mut instance, "call_ctermid", &[0]);
    assert_eq!(instance.read_string(outer as u32).unwrap(), "/dev/tty");
}

#[test]
fn test_missing_capability_is_loud() {
    let mut instance = instantiate();
    let err = instance.call("call_login_tty", &[]).unwrap_err();
    assert!(
        matches!(&err, WasmPosixError::NotImplemented(name) if name == "login_tty"),
        "got {:?}",
        err
    );
    // not reported as an errno
    assert_eq!(instance.last_errno(), 0);
}

#[test]
fn test_no_bindings() {
    let mut instance = instantiate_with(Arc::new(NoBindings));
    let err = instance.call("call_getpid", &[]).unwrap_err();
    assert!(matches!(err, WasmPosixError::NotImplemented(_)));
}

#[test]
fn test_statvfs_not_implemented() {
    let mut instance = instantiate();
    let err = instance.call("call_statvfs", &[]).unwrap_err();
    assert!(matches!(err, WasmPosixError::NotImplemented(name) if name == "statvfs"));
}

#[test]
fn test_local_blocking_calls() {
    let mut instance = instantiate();
    assert_eq!(call_i32(&mut instance, "call_sleep", &[5]), 0);

    let output = instance.call("read_line", &[4]).expect("read_line failed");
    assert_eq!(output, json!("type"));
}

#[test]
fn test_system() {
    let mut instance = instantiate();
    instance.call_with_string("echo", "warm up", &[]).unwrap();

    let output = instance
        .call_with_string("call_system", "main.so x y", &[])
        .expect("system failed");
    // 3 args, 7 + 1 + 1 bytes
    assert_eq!(output, json!(309));
    assert_eq!(call_i32(&mut instance, "dlcloses", &[]), 1);
}

#[test]
fn test_system_failure_propagates() {
    let mut instance = instantiate();
    let err = instance
        .call_with_string("call_system", "fail.so", &[])
        .unwrap_err();
    assert!(matches!(err, WasmPosixError::RuntimeError(_)), "got {:?}", err);
}

#[test]
fn test_bridge_bound_once() {
    let mut instance = instantiate();
    let bridge = Arc::clone(instance.bridge());
    let handle = instance.handle();
    let err = bridge.init(instance.store_mut(), handle).unwrap_err();
    assert!(matches!(err, WasmPosixError::AlreadyBound));
}
