// src/execwrap.rs

//! The `--ly-exec-wrapper` passthrough mode: runs a credential helper with
//! stdio preserved and mirrors its exit code.
//!
//! On Windows the child gets a hidden console so helpers invoked from the
//! desktop app never flash a terminal window.

use std::process::Command;

/// Runs the wrapped command and returns the exit code to terminate with:
/// the child's own code, or 1 when the child could not be launched or was
/// killed by a signal.
pub fn run(args: &[String]) -> i32 {
    let Some((command, rest)) = args.split_first() else {
        eprintln!("Usage: kubedeck --ly-exec-wrapper <command> [args...]");
        return 1;
    };

    let mut child = Command::new(command);
    child.args(rest);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        child.creation_flags(CREATE_NO_WINDOW);
    }

    match child.status() {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("kubedeck: failed to launch '{command}': {e}");
            1
        }
    }
}
