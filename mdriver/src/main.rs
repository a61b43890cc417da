use quicli::prelude::*;
use seg_alloc::{Bytes, SegAlloc, VecHeap, DEFAULT_MAX_HEAP};
use seg_alloc_test::{Operations, Replay, Validation};
use std::path::{Path, PathBuf};
use std::time::Instant;
use structopt::StructOpt;

/// Replay allocation traces against `seg_alloc`, checking every payload, and
/// report space utilization and throughput for each.
///
/// Traces are either malloclab `.rep` files or files with one `Alloc(n),`,
/// `Free(i),` or `Realloc(i, n),` per line.
#[derive(Debug, StructOpt)]
struct Cli {
    /// Run the full heap consistency check after every operation.
    #[structopt(long = "check")]
    check: bool,

    /// How many bytes the heap may grow to.
    #[structopt(long = "limit")]
    limit: Option<usize>,

    /// Print size and lifetime histograms for each trace.
    #[structopt(long = "histograms")]
    histograms: bool,

    /// How many times to repeat the timed replay of each trace.
    #[structopt(long = "repeat", default_value = "1")]
    repeat: u32,

    /// The traces to replay.
    #[structopt(parse(from_os_str))]
    traces: Vec<PathBuf>,

    #[structopt(flatten)]
    verbosity: Verbosity,
}

struct Row {
    name: String,
    replay: Option<Replay>,
    secs: f64,
}

fn new_heap(limit: Bytes) -> Result<SegAlloc<VecHeap>> {
    Ok(SegAlloc::new(VecHeap::with_limit(limit))?)
}

fn run_trace(cli: &Cli, path: &Path) -> Result<Row> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let contents = read_file(path)?;
    let ops = Operations::parse_trace(&name, &contents)
        .with_context(|_| format!("could not parse {}", path.display()))?;
    log::info!("{}: {} operations", name, ops.len());

    if cli.histograms {
        println!("{} sizes (log2):\n{}", name, ops.size_histogram());
        println!("{} lifetimes (operations):\n{}", name, ops.lifetime_histogram());
    }

    let limit = cli.limit.map(Bytes).unwrap_or(DEFAULT_MAX_HEAP);
    let validation = if cli.check {
        Validation::FULL
    } else {
        Validation::PAYLOADS
    };

    let replay = match ops.replay(&mut new_heap(limit)?, validation) {
        Ok(replay) => replay,
        Err(e) => {
            log::error!("{}: {}", name, e);
            return Ok(Row {
                name,
                replay: None,
                secs: 0.0,
            });
        }
    };

    let mut secs = 0.0;
    for _ in 0..cli.repeat {
        let mut heap = new_heap(limit)?;
        let start = Instant::now();
        ops.replay(&mut heap, Validation::NONE)?;
        let elapsed = start.elapsed();
        secs += elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) * 1e-9;
    }
    secs /= f64::from(cli.repeat.max(1));

    log::debug!("{}: {:?} in {} seconds", name, replay, secs);
    Ok(Row {
        name,
        replay: Some(replay),
        secs,
    })
}

fn kops(ops: usize, secs: f64) -> f64 {
    if secs > 0.0 {
        ops as f64 / secs / 1000.0
    } else {
        0.0
    }
}

fn main() -> CliResult {
    let cli = Cli::from_args();
    cli.verbosity.setup_env_logger("seg-mdriver")?;

    let mut rows = vec![];
    for path in &cli.traces {
        rows.push(run_trace(&cli, path)?);
    }

    println!(
        "{:<24} {:>5} {:>6} {:>10} {:>10} {:>10}",
        "trace", "valid", "util", "ops", "secs", "Kops"
    );
    for row in &rows {
        match row.replay {
            Some(replay) => println!(
                "{:<24} {:>5} {:>5.1}% {:>10} {:>10.6} {:>10.0}",
                row.name,
                "yes",
                replay.utilization() * 100.0,
                replay.ops,
                row.secs,
                kops(replay.ops, row.secs)
            ),
            None => println!("{:<24} {:>5}", row.name, "no"),
        }
    }

    let valid: Vec<_> = rows
        .iter()
        .filter_map(|row| row.replay.map(|replay| (replay, row.secs)))
        .collect();
    if !valid.is_empty() {
        let util = valid.iter().map(|(r, _)| r.utilization()).sum::<f64>() / valid.len() as f64;
        let ops: usize = valid.iter().map(|(r, _)| r.ops).sum();
        let secs: f64 = valid.iter().map(|(_, s)| s).sum();
        println!(
            "{:<24} {:>5} {:>5.1}% {:>10} {:>10.6} {:>10.0}",
            "Total",
            "",
            util * 100.0,
            ops,
            secs,
            kops(ops, secs)
        );
    }

    let invalid = rows.len() - valid.len();
    if invalid > 0 {
        return Err(format_err!("{} of {} traces failed validation", invalid, rows.len()).into());
    }
    Ok(())
}
