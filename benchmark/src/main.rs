use std::{
    num::NonZeroU64,
    ops::ControlFlow,
    str::FromStr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;

mod load;
mod serve;
mod wire;

#[derive(clap::Parser)]
#[clap(about = "Random-offset direct I/O write benchmark over TCP")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Open the device and handle write requests.
    Serve(serve::ServeArgs),
    /// Drive a `serve` instance with fixed-size writes and report throughput and latency.
    Load(load::LoadArgs),
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub(crate) enum RunDuration {
    UntilCtrlC,
    FixedDuration(Duration),
    FixedTotalIoCount(u64),
    FixedPerClientIoCount(u64),
}

fn parse_io_count(stripped: &str, s: &str) -> Result<u64, String> {
    let (stripped, multiplier) = if stripped.ends_with("k-") {
        (&stripped[..stripped.len() - 2], 1000)
    } else if stripped.ends_with("m-") {
        (&stripped[..stripped.len() - 2], 1000 * 1000)
    } else if stripped.ends_with("g-") {
        (&stripped[..stripped.len() - 2], 1000 * 1000 * 1000)
    } else {
        (stripped.strip_suffix('-').unwrap_or(stripped), 1)
    };
    let n = stripped
        .parse::<NonZeroU64>()
        .map_err(|e| format!("invalid io count: {e}: {s:?}"))?;
    // the count must also fit the signed budget in OpsLeft
    n.get()
        .checked_mul(multiplier)
        .filter(|count| i64::try_from(*count).is_ok())
        .ok_or_else(|| format!("invalid io count: too large: {s:?}"))
}

impl FromStr for RunDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "until-ctrl-c" => Ok(RunDuration::UntilCtrlC),
            x if x.ends_with("ios-total") => {
                let stripped = &s[..s.len() - "ios-total".len()];
                parse_io_count(stripped, s).map(RunDuration::FixedTotalIoCount)
            }
            x if x.ends_with("ios-per-client") => {
                let stripped = &s[..s.len() - "ios-per-client".len()];
                parse_io_count(stripped, s).map(RunDuration::FixedPerClientIoCount)
            }
            x => match humantime::parse_duration(x) {
                Ok(d) => Ok(RunDuration::FixedDuration(d)),
                Err(e) => Err(format!("invalid duration: {e}: {s:?}")),
            },
        }
    }
}

/// Shared or per-client budget of requests for count-bounded runs.
#[derive(Clone)]
pub(crate) struct OpsLeft(Option<Arc<AtomicI64>>);

impl OpsLeft {
    pub(crate) fn for_clients(run_duration: &RunDuration, num_clients: u64) -> Vec<OpsLeft> {
        let mut fixed_total_io_count_ops_left = None;
        (0..num_clients)
            .map(|_| match run_duration {
                RunDuration::UntilCtrlC => OpsLeft(None),
                RunDuration::FixedDuration(_) => OpsLeft(None),
                RunDuration::FixedTotalIoCount(total_io_count) => {
                    let shared = fixed_total_io_count_ops_left.get_or_insert_with(|| {
                        Arc::new(AtomicI64::new(
                            i64::try_from(*total_io_count).unwrap_or(i64::MAX),
                        ))
                    });
                    OpsLeft(Some(Arc::clone(shared)))
                }
                RunDuration::FixedPerClientIoCount(per_client) => {
                    // create a separate OpsLeft per client
                    OpsLeft(Some(Arc::new(AtomicI64::new(
                        i64::try_from(*per_client).unwrap_or(i64::MAX),
                    ))))
                }
            })
            .collect()
    }

    pub(crate) fn take_one_op(&self) -> ControlFlow<()> {
        match &self.0 {
            None => (),
            Some(ops_left) => {
                let ops_left = ops_left.fetch_sub(1, Ordering::Relaxed);
                if ops_left <= 0 {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter({
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        })
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve::main(args),
        Command::Load(args) => load::main(args),
    }
}
