//! Process identity and environment queries from `<unistd.h>`.

use nix::errno::Errno;

use super::bindings::{HostBindings, HostResult};
use super::{ImportMap, Syscall};
use crate::wasm::Destination;

type Query = fn(&dyn HostBindings) -> HostResult<i32>;

pub(super) fn register(map: &mut ImportMap) {
    let identity: [(&str, Query); 7] = [
        ("getpid", |b| b.getpid()),
        ("getppid", |b| b.getppid()),
        ("getuid", |b| b.getuid()),
        ("geteuid", |b| b.geteuid()),
        ("getgid", |b| b.getgid()),
        ("getegid", |b| b.getegid()),
        ("setsid", |b| b.setsid()),
    ];
    for (name, query) in identity {
        map.insert(
            name,
            Syscall::i32(0, move |cx, _| {
                let res = query(&*cx.bindings());
                cx.check(res)
            }),
        );
    }

    map.insert(
        "getpgid",
        Syscall::i32(1, |cx, args| {
            let res = cx.bindings().getpgid(args[0]);
            cx.check(res)
        }),
    );

    map.insert(
        "kill",
        Syscall::i32(2, |cx, args| match cx.bindings().kill(args[0], args[1]) {
            Ok(()) => Ok(0),
            Err(e) => cx.fail(e, -1),
        }),
    );

    // int gethostname(char *name, size_t len)
    map.insert(
        "gethostname",
        Syscall::i32(2, |cx, args| {
            let (ptr, len) = (args[0] as u32, args[1]);
            let name = match cx.bindings().gethostname() {
                Ok(name) => name,
                Err(e) => return cx.fail(e, -1),
            };
            if len <= 0 {
                cx.set_errno(Errno::EINVAL)?;
                return Ok(-1);
            }
            if name.len() >= len as usize {
                cx.set_errno(Errno::ENAMETOOLONG)?;
                return Ok(-1);
            }
            cx.send_string(
                &name,
                Some(Destination {
                    ptr,
                    capacity: len as usize,
                }),
            )?;
            Ok(0)
        }),
    );

    // char *getcwd(char *buf, size_t size)
    //
    // A null buffer gets a fresh allocation the sandbox frees, as in glibc.
    map.insert(
        "getcwd",
        Syscall::i32(2, |cx, args| {
            let (ptr, size) = (args[0] as u32, args[1]);
            let cwd = match cx.bridge().capabilities().cwd() {
                Ok(cwd) => cwd,
                Err(e) => return cx.fail(e.into(), 0),
            };
            if ptr == 0 {
                return Ok(cx.send_string(&cwd, None)? as i32);
            }
            if size <= 0 {
                cx.set_errno(Errno::EINVAL)?;
                return Ok(0);
            }
            if cwd.len() + 1 > size as usize {
                cx.set_errno(Errno::ERANGE)?;
                return Ok(0);
            }
            cx.send_string(
                &cwd,
                Some(Destination {
                    ptr,
                    capacity: size as usize,
                }),
            )?;
            Ok(ptr as i32)
        }),
    );
}
