//! Command-line helpers shared by the binaries.
//!
//! Helper daemons receive their flags in the single-dash style the launch
//! plan emits (`-hci_port=7300`); clap only accepts long flags with two
//! dashes, so argv is rewritten before parsing.

use std::ffi::OsString;

use crate::launch::ExitCode;

/// Exit code for a failed clap parse: `--help` and `--version` succeed,
/// anything else is an argument error.
pub fn usage_exit_code(err: &clap::Error) -> ExitCode {
    if err.use_stderr() {
        ExitCode::ArgumentParsingError
    } else {
        ExitCode::Success
    }
}

/// Rewrite `-name=value` and `-name` to `--name=value` / `--name`.
///
/// The program name, arguments that already start with `--`, lone `-`,
/// short flags (`-h`, `-V`) and anything after a `--` separator are left
/// untouched.
pub fn normalize_single_dash<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (i, arg) in args.into_iter().enumerate() {
        if i == 0 || passthrough {
            out.push(arg);
            continue;
        }
        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        if text == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        let is_long_single_dash = text.starts_with('-')
            && !text.starts_with("--")
            && text.split('=').next().is_some_and(|name| name.len() > 2);
        if is_long_single_dash {
            out.push(OsString::from(format!("-{text}")));
        } else {
            out.push(arg);
        }
    }
    out
}
