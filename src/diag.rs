//! Stderr diagnostics. No logging crate: plain, human-readable lines are
//! all this tunnel ever needs, printed with `eprintln!` directly.

use std::fmt::Arguments;

/// Gates noisy, per-packet diagnostics behind `-d`; connection-level events
/// are always printed.
#[derive(Debug, Clone, Copy)]
pub struct Diag {
    verbose: bool,
}

impl Diag {
    pub fn new(verbose: bool) -> Self {
        Diag { verbose }
    }

    /// Always printed: startup, shutdown, fatal conditions.
    pub fn info(&self, args: Arguments<'_>) {
        eprintln!("{args}");
    }

    /// Printed only with `-d`: per-packet drops, overruns, FSM transitions.
    pub fn debug(&self, args: Arguments<'_>) {
        if self.verbose {
            eprintln!("{args}");
        }
    }
}
