pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_TOLERANCE_MS: u64 = 500;

/// Process exit codes besides the per-verdict ones in `Verdict::exit_code`.
pub const EXIT_SUITE_FAILED: i32 = 1;
pub const EXIT_LAUNCH_ERROR: i32 = 2;
pub const EXIT_CONFIG_ERROR: i32 = 3;
pub const EXIT_OUTPUT_ERROR: i32 = 4;
