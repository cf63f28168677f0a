use std::io::{stderr, stdin, stdout, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use crucible_mach::stdio::{read_plan, write_plan};
use crucible_mach::{run_phase, CancelToken, EventWriter, MachConfig};
use crucible_plan::{BatchQuantities, QuantitySet};

/// Machine-dependent phase: compile and run a plan's corpus on this host.
///
/// Reads one plan (JSON, optionally gzipped) from stdin, writes the result
/// plan to stdout, and reports progress as JSON events on stderr.
#[derive(Parser, Debug)]
#[command(name = "crucible-mach", version)]
struct Cli {
    /// Directory compile artifacts are placed under.
    #[arg(long)]
    out_dir: PathBuf,

    /// Per-subject compile timeout in milliseconds (0 = use plan/default).
    #[arg(long, default_value_t = 0)]
    compile_timeout_ms: u64,

    /// Per-subject run timeout in milliseconds (0 = use plan/default).
    #[arg(long, default_value_t = 0)]
    run_timeout_ms: u64,

    /// Compile worker threads (0 = use plan/default).
    #[arg(long, default_value_t = 0)]
    compile_workers: usize,

    /// Run worker threads (0 = use plan/default).
    #[arg(long, default_value_t = 0)]
    run_workers: usize,
}

impl Cli {
    fn quantities(&self) -> QuantitySet {
        QuantitySet {
            compile: BatchQuantities {
                workers: self.compile_workers,
                timeout_ms: self.compile_timeout_ms,
            },
            run: BatchQuantities {
                workers: self.run_workers,
                timeout_ms: self.run_timeout_ms,
            },
        }
    }
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("crucible-mach: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let plan = read_plan(stdin().lock()).context("reading plan from stdin")?;

    // Lowest priority first: built-in, plan-embedded, command line.
    let mut quantities = QuantitySet::builtin_default();
    quantities.override_with(&plan.quantities);
    quantities.override_with(&cli.quantities());

    let config = MachConfig {
        out_dir: cli.out_dir,
        quantities,
    };
    let token = CancelToken::new();
    let events = EventWriter::new(stderr());

    let plan = run_phase(plan, &config, &token, &events)?;

    let mut out = stdout().lock();
    write_plan(&mut out, &plan)?;
    out.flush().context("flushing stdout")?;
    Ok(ExitCode::SUCCESS)
}
