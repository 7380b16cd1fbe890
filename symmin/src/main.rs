/*
 * Minimize a testcase that crashes a symbol demangler.
 *
 * Wraps symlib's reduction pipeline around a concrete oracle that runs
 * the demangler (c++filt by default) on each candidate and watches for
 * a fatal signal. Supports a single testcase (argument or file) or a
 * sharded batch run over a newline-separated corpus.
 */

use std::fs;
use std::io::{self, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use clap::Parser;

use symlib::{escape_bytes, reduce_crash, Cache, Oracle, OracleError, ReduceOptions};

/* The demangler gets one second of CPU and a modest RSS cap, so a
 * candidate that sends it into an exponential corner cannot stall the
 * whole reduction. */
const DEMANGLER_CPU_SECONDS: u64 = 1;
const DEMANGLER_RSS_BYTES: u64 = 50_000_000;

#[derive(Parser, Debug)]
#[command(name = "symmin", about = "Minimize a crashing demangler testcase")]
struct Cli {
    /// Mangled symbol to minimize
    #[arg(value_name = "SYMBOL", conflicts_with_all = ["file", "batch"])]
    symbol: Option<String>,

    /// Read the testcase from a file (trailing newline stripped)
    #[arg(short, long, value_name = "FILE", conflicts_with = "batch")]
    file: Option<PathBuf>,

    /// Demangler binary to run on each candidate
    #[arg(long, default_value = "c++filt")]
    demangler: String,

    /// Only accept candidates that die with this exact signal number
    #[arg(long, value_name = "N")]
    signal: Option<i32>,

    /// Suppress per-reduction progress output
    #[arg(short, long)]
    quiet: bool,

    /// Use the quadratic remove-middle variant as well
    #[arg(long)]
    slow: bool,

    /// Finish with a pass that rewrites non-identifier bytes
    #[arg(long)]
    fix_non_alnum: bool,

    /// Minimize every testcase in a newline-separated corpus file
    #[arg(long, value_name = "CORPUS")]
    batch: Option<PathBuf>,

    /// Total number of batch workers sharding the corpus
    #[arg(long, default_value_t = 1)]
    workers: u32,

    /// 1-based index of this worker
    #[arg(long, default_value_t = 1)]
    worker: u32,

    /// Output file for batch results (default: CORPUS.min.WORKER)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

/* Runs the demangler on a candidate and reports whether it crashed. */
struct CrashOracle {
    command: String,
    expected_signal: Option<i32>,
}

impl CrashOracle {
    fn new(command: String, expected_signal: Option<i32>) -> Self {
        CrashOracle {
            command,
            expected_signal,
        }
    }
}

impl Oracle for CrashOracle {
    fn verify(&self, candidate: &[u8]) -> Result<bool, OracleError> {
        let mut child = Command::new(&self.command);
        child
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        /* Safety: the closure only calls async-signal-safe libc
         * functions between fork and exec. */
        unsafe {
            child.pre_exec(|| {
                let cpu = libc::rlimit {
                    rlim_cur: DEMANGLER_CPU_SECONDS,
                    rlim_max: DEMANGLER_CPU_SECONDS,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                    return Err(io::Error::last_os_error());
                }
                let rss = libc::rlimit {
                    rlim_cur: DEMANGLER_RSS_BYTES,
                    rlim_max: DEMANGLER_RSS_BYTES,
                };
                if libc::setrlimit(libc::RLIMIT_RSS, &rss) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = child.spawn().map_err(|source| OracleError::Launch {
            command: self.command.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            /* A write error here usually means the target already died
             * before draining stdin, which is the crash we are after,
             * so it is not an oracle failure. */
            let _ = stdin.write_all(candidate);
            let _ = stdin.write_all(b"\n");
        }
        let status = child.wait()?;
        Ok(signal_matches(self.expected_signal, status))
    }
}

/* A run killed by the CPU limit (SIGXCPU, or SIGKILL once the hard
 * limit hits) is a hang, not a reproduction. Any other fatal signal
 * counts, unless the caller pinned an exact one. */
fn signal_matches(expected: Option<i32>, status: ExitStatus) -> bool {
    match status.signal() {
        Some(sig) => match expected {
            Some(expected) => sig == expected,
            None => sig != libc::SIGKILL && sig != libc::SIGXCPU,
        },
        None => false,
    }
}

fn trim_trailing_newline(mut data: Vec<u8>) -> Vec<u8> {
    if data.last() == Some(&b'\n') {
        data.pop();
        if data.last() == Some(&b'\r') {
            data.pop();
        }
    }
    data
}

fn read_testcase(cli: &Cli) -> Result<Vec<u8>> {
    if let Some(ref symbol) = cli.symbol {
        return Ok(symbol.clone().into_bytes());
    }
    if let Some(ref path) = cli.file {
        let data = fs::read(path)
            .with_context(|| format!("failed to read testcase file {}", path.display()))?;
        return Ok(trim_trailing_newline(data));
    }
    bail!("no testcase given: pass a SYMBOL argument, --file, or --batch");
}

fn assigned_to_worker(ind: usize, workers: u32, worker: u32) -> bool {
    ind as u64 % u64::from(workers) == u64::from(worker - 1)
}

fn default_batch_output(corpus: &Path, worker: u32) -> PathBuf {
    let mut name = corpus.as_os_str().to_os_string();
    name.push(format!(".min.{}", worker));
    PathBuf::from(name)
}

fn run_batch(cli: &Cli, oracle: &CrashOracle, corpus: &Path) -> Result<()> {
    if cli.workers == 0 {
        bail!("--workers must be at least 1");
    }
    if cli.worker == 0 || cli.worker > cli.workers {
        bail!("--worker must be between 1 and --workers");
    }
    let data = fs::read(corpus)
        .with_context(|| format!("failed to read corpus file {}", corpus.display()))?;
    let out_path = match cli.output {
        Some(ref path) => path.clone(),
        None => default_batch_output(corpus, cli.worker),
    };
    let mut out = fs::File::create(&out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;

    /* One cache across the whole shard: a testcase whose reduction
     * walks through an already-seen intermediate can only converge to
     * an already-written result, so it is dropped as a duplicate. */
    let mut cache = Cache::new();
    let options = ReduceOptions {
        quiet: true,
        slow_middle: cli.slow,
        fix_non_alnum: cli.fix_non_alnum,
    };
    let mut minimized = 0usize;
    for (ind, line) in data.split(|&b| b == b'\n').enumerate() {
        if line.is_empty() || !assigned_to_worker(ind, cli.workers, cli.worker) {
            continue;
        }
        match reduce_crash(oracle, line, options, Some(&mut cache))? {
            Some(result) => {
                minimized += 1;
                println!(
                    "Worker {}. \"{}\"; {} minimized testcases, position: {}",
                    cli.worker,
                    escape_bytes(&result),
                    minimized,
                    ind + 1
                );
                out.write_all(&result)?;
                out.write_all(b"\n")?;
            }
            None => {
                if (ind + 1) % 100 == 0 {
                    println!("Skipped... {}", ind + 1);
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let oracle = CrashOracle::new(cli.demangler.clone(), cli.signal);

    if let Some(ref corpus) = cli.batch {
        let corpus = corpus.clone();
        return run_batch(&cli, &oracle, &corpus);
    }

    let testcase = read_testcase(&cli)?;
    let options = ReduceOptions {
        quiet: cli.quiet,
        slow_middle: cli.slow,
        fix_non_alnum: cli.fix_non_alnum,
    };
    match reduce_crash(&oracle, &testcase, options, None)? {
        Some(result) => {
            if cli.quiet {
                println!("{}", escape_bytes(&result));
            }
        }
        /* Unreachable without a cache, but keep the contract honest. */
        None => bail!("reduction produced no result"),
    }
    Ok(())
}
