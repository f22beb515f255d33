//! Fatal-error reporting for the command-line front end.
//!
//! Core errors are not recoverable once they reach the process boundary;
//! this formats and exits rather than unwinding, mirroring the reference
//! emulator's `fatal`/`fatalf` macros.

/// Prints `fatal: <file>:<line> <message>` to stderr and exits with 1.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("fatal: {}:{} {}", file!(), line!(), format_args!($($arg)*));
        std::process::exit(1);
    }};
}

pub(crate) use fatal;
