//! CLI subcommands

pub mod classify;
pub mod cloud;
pub mod invoke;
pub mod state;

/// Exit code asking the caller to invoke again later (EX_TEMPFAIL)
pub const EXIT_RETRY: i32 = 75;
