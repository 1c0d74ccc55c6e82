//! Subprocess emulation.

use super::{ImportMap, Syscall};

pub(super) fn register(map: &mut ImportMap) {
    // int system(const char *command)
    //
    // There is no shell: the command is split on whitespace and its first
    // word loaded as a library in this same sandbox. The exit code is
    // returned as is, not in wait-status form.
    map.insert(
        "system",
        Syscall::i32(1, |cx, args| {
            let ptr = args[0] as u32;
            if ptr == 0 {
                // "is a command processor available?"
                return Ok(1);
            }
            let command = cx.read_string(ptr)?;
            let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                return Ok(0);
            }
            cx.run(&argv)
        }),
    );
}
