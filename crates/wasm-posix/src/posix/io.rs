//! Calls that block the sandbox: sleeping and reading the terminal.
//!
//! On a worker these go to the owning thread, which does the real wait and
//! wakes the worker through the shared control word. Otherwise they run
//! right here on the host bindings.

use std::time::Duration;

use super::{ImportMap, Syscall};

pub(super) fn register(map: &mut ImportMap) {
    // unsigned sleep(unsigned seconds)
    map.insert(
        "sleep",
        Syscall::i32(1, |cx, args| {
            let duration = Duration::from_secs(args[0].max(0) as u64);
            pause(cx, duration)
        }),
    );

    // int usleep(useconds_t usec)
    map.insert(
        "usleep",
        Syscall::i32(1, |cx, args| {
            let duration = Duration::from_micros(args[0] as u32 as u64);
            pause(cx, duration)
        }),
    );

    // Read up to `len` bytes of stdin into `ptr`, returning the count.
    // Zero means end of input.
    map.insert(
        "wasm_read_stdin",
        Syscall::i32(2, |cx, args| {
            let (ptr, len) = (args[0] as u32, args[1].max(0) as usize);
            let bytes = match cx.bridge().capabilities().blocking() {
                Some(client) => client.read_stdin(len)?,
                None => {
                    let mut buf = vec![0u8; len];
                    match cx.bindings().read_stdin(&mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            buf
                        }
                        Err(e) => return cx.fail(e, -1),
                    }
                }
            };
            cx.write_memory(ptr, &bytes)?;
            Ok(bytes.len() as i32)
        }),
    );
}

fn pause(cx: &mut super::SyscallContext<'_, '_>, duration: Duration) -> crate::error::Result<i32> {
    if let Some(client) = cx.bridge().capabilities().blocking() {
        client.sleep(duration)?;
        return Ok(0);
    }
    match cx.bindings().sleep(duration) {
        Ok(()) => Ok(0),
        Err(e) => cx.fail(e, -1),
    }
}
