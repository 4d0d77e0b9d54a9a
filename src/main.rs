use std::{panic, path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use executable_monitor::{
    commands::{RunOptions, native_runner, run_command, suite_command},
    constants::{DEFAULT_TIMEOUT_MS, DEFAULT_TOLERANCE_MS},
    monitor::{
        domain::{DEFAULT_LOOP_COUNT, ExpectedDuration},
        pipeline::monitoring::DEFAULT_DRAIN_GRACE,
    },
    report::Format,
};

#[derive(Parser)]
#[command(
    name = "monitor",
    version,
    about = "Runs a subject executable and checks its heartbeats, deadlines and exit code",
    after_help = "EXIT CODES:
    0   pass
    1   suite had at least one failure
    2   subject could not be launched
    3   invalid configuration
    4   report could not be rendered
    10  timing violation
    11  timeout
    12  exit code mismatch
    13  crashed
    14  parse error (missing heartbeats)"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a single subject
    #[command(after_help = "EXAMPLES:
    monitor run --subject ./test --loops 5 --expect-exit 0 --timeout-ms 60000 --tolerance-ms 500
    monitor run --subject ./test --loops 3 -- {loops} {exit}
    monitor run --subject ./cube --expected-sleep cubic --heartbeat-grace-ms 2000

Arguments after `--` are passed to the subject; `{loops}` and `{exit}` are
replaced with the --loops and --expect-exit values.")]
    Run(RunArgs),

    /// Run every subject and footprint check listed in a TOML suite file
    Suite {
        /// Path to the suite file
        #[arg(long)]
        config: PathBuf,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the subject executable
    #[arg(long)]
    subject: PathBuf,

    /// Loop count of the subject; it emits loops - 1 heartbeats
    #[arg(long, default_value_t = DEFAULT_LOOP_COUNT)]
    loops: u32,

    /// Exit code the subject must finish with
    #[arg(long = "expect-exit", default_value_t = 0, allow_negative_numbers = true)]
    expect_exit: i32,

    /// Wall-clock budget for the whole run
    #[arg(long = "timeout-ms", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Allowed drift between a heartbeat's declared sleep and the observed gap
    #[arg(long = "tolerance-ms", default_value_t = DEFAULT_TOLERANCE_MS)]
    tolerance_ms: u64,

    /// Declared sleep per iteration: linear[:step], cubic or constant:<n>
    #[arg(long = "expected-sleep", default_value = "linear:3")]
    expected_sleep: ExpectedDuration,

    /// Kill the subject if the next heartbeat is this late (beyond declared sleep + tolerance)
    #[arg(long = "heartbeat-grace-ms")]
    heartbeat_grace_ms: Option<u64>,

    /// How long to keep reading output after the subject exits
    #[arg(long = "drain-grace-ms", default_value_t = DEFAULT_DRAIN_GRACE.as_millis() as u64)]
    drain_grace_ms: u64,

    /// Number of consecutive runs
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    runs: u32,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Arguments passed to the subject
    #[arg(last = true)]
    subject_args: Vec<String>,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            subject: args.subject,
            subject_args: args.subject_args,
            loops: args.loops,
            expect_exit: args.expect_exit,
            timeout_ms: args.timeout_ms,
            tolerance_ms: args.tolerance_ms,
            expected_sleep: args.expected_sleep,
            heartbeat_grace_ms: args.heartbeat_grace_ms,
            drain_grace_ms: args.drain_grace_ms,
            runs: args.runs,
            format: args.format,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let runner = native_runner();

    let outcome = match cli.command {
        Commands::Run(args) => run_command(args.into(), runner).await,
        Commands::Suite { config, format } => suite_command(config, format, runner).await,
    };

    let code = match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("monitor: {}", err);
            err.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
