//! Terminal and filesystem-stat calls WASI has no equivalent for.

use nix::errno::Errno;

use super::{ImportMap, Syscall};
use crate::error::WasmPosixError;
use crate::wasm::Destination;

pub(super) fn register(map: &mut ImportMap) {
    map.insert(
        "isatty",
        Syscall::i32(1, |cx, args| match cx.bindings().isatty(args[0]) {
            Ok(true) => Ok(1),
            Ok(false) => {
                cx.set_errno(Errno::ENOTTY)?;
                Ok(0)
            }
            Err(e) => cx.fail(e, 0),
        }),
    );

    // char *ctermid(char *s)
    //
    // Without a buffer the answer lives in one sandbox allocation that is
    // reused for the life of the instance.
    map.insert(
        "ctermid",
        Syscall::i32(1, |cx, args| {
            let ptr = args[0] as u32;
            if ptr == 0 {
                if let Some(cached) = cx.data_mut().posix.ctermid {
                    return Ok(cached as i32);
                }
            }
            let path = match cx.bindings().ctermid() {
                Ok(path) => path,
                Err(e) => return cx.fail(e, 0),
            };
            if ptr != 0 {
                let dest = Destination {
                    ptr,
                    capacity: path.len() + 1,
                };
                return Ok(cx.send_string(&path, Some(dest))? as i32);
            }
            let cached = cx.send_string(&path, None)?;
            cx.data_mut().posix.ctermid = Some(cached);
            Ok(cached as i32)
        }),
    );

    map.insert(
        "login_tty",
        Syscall::i32(1, |cx, args| match cx.bindings().login_tty(args[0]) {
            Ok(()) => Ok(0),
            Err(e) => cx.fail(e, -1),
        }),
    );

    map.insert(
        "statvfs",
        Syscall::i32(2, |_, _| Err(WasmPosixError::NotImplemented("statvfs".to_string()))),
    );
    map.insert(
        "fstatvfs",
        Syscall::i32(2, |_, _| Err(WasmPosixError::NotImplemented("fstatvfs".to_string()))),
    );
}
