use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroU64,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use crossbeam_utils::CachePadded;
use futures::{SinkExt, StreamExt};
use hdrhistogram::Counter;
use itertools::Itertools;
use rand::RngCore;
use serde_with::serde_as;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use crate::{
    wire::{self, WireResponse},
    OpsLeft, RunDuration,
};

#[derive(serde::Serialize, clap::Args, Clone)]
pub(crate) struct LoadArgs {
    num_clients: NonZeroU64,
    /// Each request carries `1 << block_size_shift` bytes.
    #[clap(value_parser = clap::value_parser!(u32).range(0..=22))]
    block_size_shift: u32,
    #[clap(long, default_value = "127.0.0.1:8002")]
    target: SocketAddr,
    #[clap(long, default_value = "until-ctrl-c")]
    run_duration: RunDuration,
}

impl LoadArgs {
    fn block_size(&self) -> usize {
        1 << self.block_size_shift
    }
}

const MONITOR_PERIOD: Duration = Duration::from_secs(1);

struct StatsState {
    writes_in_last_second: Vec<CachePadded<AtomicU64>>,
    errors_in_last_second: Vec<CachePadded<AtomicU64>>,
    latencies_histo: Vec<CachePadded<Mutex<hdrhistogram::Histogram<u64>>>>,
    last_cpu_usage: Mutex<String>,
}

impl StatsState {
    fn new(num_clients: usize) -> Self {
        StatsState {
            writes_in_last_second: (0..num_clients)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            errors_in_last_second: (0..num_clients)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            latencies_histo: (0..num_clients)
                .map(|_| CachePadded::new(Mutex::new(StatsState::make_latency_histogram())))
                .collect(),
            last_cpu_usage: Mutex::new(String::new()),
        }
    }
    fn make_latency_histogram() -> hdrhistogram::Histogram<u64> {
        hdrhistogram::Histogram::new_with_bounds(1, 1_000_000_000, 3).unwrap()
    }
    fn record_iop_latency(&self, client_num: usize, latency: Duration) {
        let mut h = self.latencies_histo[client_num].lock().unwrap();
        h.saturating_record(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX));
    }
}

struct RunResult {
    client_run_times: Vec<Duration>,
}

pub(crate) fn main(args: LoadArgs) {
    let args = Arc::new(args);
    let num_clients = usize::try_from(args.num_clients.get()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let (stop_monitor_tx, stop_monitor_rx) = tokio::sync::oneshot::channel::<RunResult>();
    let stats_state = Arc::new(StatsState::new(num_clients));
    let ops_left = OpsLeft::for_clients(&args.run_duration, args.num_clients.get());

    match args.run_duration {
        RunDuration::UntilCtrlC => {}
        RunDuration::FixedDuration(duration) => {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                info!("configured runtime expired, setting stop flag");
                stop.store(true, Ordering::Relaxed);
            });
        }
        RunDuration::FixedTotalIoCount(_) => {
            // enforced through ops_left
        }
        RunDuration::FixedPerClientIoCount(_) => {
            // enforced through ops_left
        }
    }

    ctrlc::set_handler({
        let stop = Arc::clone(&stop);
        move || {
            info!("ctrl-c, setting stop flag");
            if stop.fetch_or(true, Ordering::Relaxed) {
                error!("stop flag was already set, aborting");
                std::process::abort();
            } else {
                info!("first ctrl-c, stop flag set");
            }
        }
    })
    .unwrap();

    let clients_and_monitor_ready = Arc::new(tokio::sync::Barrier::new(num_clients + 1));

    let monitor = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn({
            let stats_state = Arc::clone(&stats_state);
            let args = Arc::clone(&args);
            let clients_and_monitor_ready = Arc::clone(&clients_and_monitor_ready);
            move || monitor(args, stats_state, clients_and_monitor_ready, stop_monitor_rx)
        })
        .unwrap();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let res = rt.block_on(async {
        let mut handles = Vec::with_capacity(num_clients);
        for (i, ops_left) in ops_left.into_iter().enumerate() {
            handles.push(tokio::spawn(client(
                i,
                Arc::clone(&args),
                ops_left,
                Arc::clone(&stop),
                Arc::clone(&stats_state),
                Arc::clone(&clients_and_monitor_ready),
            )));
        }
        let mut client_run_times = Vec::with_capacity(num_clients);
        for handle in handles {
            client_run_times.push(handle.await.unwrap());
        }
        RunResult { client_run_times }
    });
    if stop_monitor_tx.send(res).is_err() {
        error!("monitor exited before the clients finished");
    }
    monitor.join().unwrap();
}

async fn client(
    i: usize,
    args: Arc<LoadArgs>,
    ops_left: OpsLeft,
    stop: Arc<AtomicBool>,
    stats_state: Arc<StatsState>,
    clients_ready: Arc<tokio::sync::Barrier>,
) -> Duration {
    let stream = TcpStream::connect(args.target).await;
    // everyone must reach the barrier, or the others wait forever
    clients_ready.wait().await;
    let stream = match stream.and_then(|s| s.set_nodelay(true).map(|()| s)) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Client {i} cannot connect to {}: {e}", args.target);
            return Duration::ZERO;
        }
    };
    let mut framed = Framed::new(stream, wire::codec(wire::DEFAULT_MAX_FRAME_BYTES));

    // pseudo-random so that nothing below us can dedupe or compress it
    let mut payload = vec![0; args.block_size()];
    rand::thread_rng().fill_bytes(&mut payload);
    let payload = Bytes::from(payload);

    info!("Client {i} starting");
    let start = std::time::Instant::now();
    while !stop.load(Ordering::Relaxed) {
        let ControlFlow::Continue(()) = ops_left.take_one_op() else {
            break;
        };
        let op_start = std::time::Instant::now();
        if let Err(e) = framed.send(payload.clone()).await {
            error!("Client {i} send failed: {e}");
            break;
        }
        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                error!("Client {i} receive failed: {e}");
                break;
            }
            None => {
                error!("Client {i}: server closed the connection");
                break;
            }
        };
        let latency = op_start.elapsed();
        let response: WireResponse = match serde_json::from_slice(&frame) {
            Ok(response) => response,
            Err(e) => {
                error!("Client {i} cannot decode response: {e}");
                break;
            }
        };
        if !response.cpu_usage.is_empty() {
            *stats_state.last_cpu_usage.lock().unwrap() = response.cpu_usage;
        }
        match response.error {
            None => {
                stats_state.writes_in_last_second[i].fetch_add(1, Ordering::Relaxed);
                stats_state.record_iop_latency(i, latency);
            }
            Some(e) => {
                stats_state.errors_in_last_second[i].fetch_add(1, Ordering::Relaxed);
                warn!("Client {i} request failed: {}: {}", e.code, e.message);
            }
        }
    }
    info!("Client {i} stopping");
    start.elapsed()
}

/// What all clients did during one monitor period.
struct Interval {
    writes_per_client: Vec<u64>,
    errors: u64,
    latencies: hdrhistogram::Histogram<u64>,
}

impl StatsState {
    /// Take and zero everything the clients recorded since the last call.
    fn drain(&self) -> Interval {
        let mut latencies = StatsState::make_latency_histogram();
        for h in &self.latencies_histo {
            let mut h = h.lock().unwrap();
            latencies += &*h;
            h.clear();
        }
        Interval {
            writes_per_client: self
                .writes_in_last_second
                .iter()
                .map(|c| c.swap(0, Ordering::Relaxed))
                .collect(),
            errors: self
                .errors_in_last_second
                .iter()
                .map(|c| c.swap(0, Ordering::Relaxed))
                .sum(),
            latencies,
        }
    }
    fn server_cpu_usage(&self) -> String {
        self.last_cpu_usage.lock().unwrap().clone()
    }
}

struct AggregatedStats {
    start: std::time::Instant,
    op_count: u64,
    error_count: u64,
    op_size: u64,
    latencies_histo: hdrhistogram::Histogram<u64>,
}

const LATENCY_PERCENTILES: [f64; 7] = [50.0, 90.0, 99.0, 99.9, 99.99, 99.999, 99.9999];

fn latency_percentiles_serialize<S>(
    values: &[f64; LATENCY_PERCENTILES.len()],
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serde::Serialize::serialize(
        &LATENCY_PERCENTILES
            .iter()
            .map(|p| format!("p{p}"))
            .zip(values.iter().cloned())
            .collect::<HashMap<_, _>>(),
        serializer,
    )
}

#[serde_as]
#[derive(serde::Serialize)]
struct AggregatedStatsSummary {
    #[serde_as(as = "serde_with::DurationMicroSeconds")]
    elapsed_us: std::time::Duration,
    throughput_iops: f64,
    throughput_bw_mibps: f64,
    errors: u64,
    latency_min_us: f64,
    latency_mean_us: f64,
    latency_max_us: f64,
    #[serde(serialize_with = "latency_percentiles_serialize")]
    latency_percentiles: [f64; LATENCY_PERCENTILES.len()],
    server_cpu_usage: String,
}

impl std::fmt::Display for AggregatedStatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{:.2} TP: iops={:.0} bw={:.2} errors={} CPU: {} LAT(us): min={:.0} mean={:.0} max={:.0} {}",
            self.elapsed_us.as_secs_f64(),
            self.throughput_iops,
            self.throughput_bw_mibps,
            self.errors,
            if self.server_cpu_usage.is_empty() {
                "-"
            } else {
                &self.server_cpu_usage
            },
            self.latency_min_us,
            self.latency_mean_us,
            self.latency_max_us,
            self.latency_percentiles
                .iter()
                .zip(LATENCY_PERCENTILES.iter())
                .map(|(v, p)| format!("p{p}={v:.0}"))
                .join(" "),
        )
    }
}

impl AggregatedStats {
    fn new(op_size: u64) -> Self {
        Self {
            start: std::time::Instant::now(),
            op_count: 0,
            error_count: 0,
            op_size,
            latencies_histo: StatsState::make_latency_histogram(),
        }
    }
    fn add(&mut self, interval: &Interval) {
        self.op_count += interval.writes_per_client.iter().sum::<u64>();
        self.error_count += interval.errors;
        self.latencies_histo += &interval.latencies;
    }
    fn summary_since_start(&self, server_cpu_usage: String) -> AggregatedStatsSummary {
        let elapsed = self.start.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        let histo = &self.latencies_histo;
        let ops_per_sec = self.op_count as f64 / elapsed_secs;
        AggregatedStatsSummary {
            elapsed_us: elapsed,
            throughput_iops: ops_per_sec,
            throughput_bw_mibps: ops_per_sec * self.op_size as f64 / (1 << 20) as f64,
            errors: self.error_count,
            latency_min_us: histo.min().as_f64() / 1000.0,
            latency_mean_us: histo.mean() / 1000.0,
            latency_max_us: histo.max().as_f64() / 1000.0,
            latency_percentiles: LATENCY_PERCENTILES
                .map(|p| histo.value_at_percentile(p).as_f64() / 1000.0),
            server_cpu_usage,
        }
    }
}

#[derive(serde::Serialize)]
struct BenchmarkOutput {
    args: LoadArgs,
    sorted_per_client_total_writes: Vec<u64>,
    sorted_per_client_runtimes_secs: Vec<f64>,
    totals: Vec<AggregatedStatsSummary>,
}

const OUTPUT_PATH: &str = "benchmark.output.json";

fn write_output(path: &std::path::Path, output: &BenchmarkOutput) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), output)?;
    Ok(())
}

fn monitor(
    args: Arc<LoadArgs>,
    stats_state: Arc<StatsState>,
    clients_and_monitor_ready: Arc<tokio::sync::Barrier>,
    mut stop_monitor_rx: tokio::sync::oneshot::Receiver<RunResult>,
) {
    let op_size = args.block_size() as u64;
    let mut per_client_total_writes = vec![0; stats_state.writes_in_last_second.len()];
    let mut total_summaries = Vec::new();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    rt.block_on(clients_and_monitor_ready.wait());
    let mut total = AggregatedStats::new(op_size);
    let mut ticker = rt.block_on(async move { tokio::time::interval(MONITOR_PERIOD) });

    let client_run_times = loop {
        let mut this_round = AggregatedStats::new(op_size);
        let exit = rt.block_on(async {
            tokio::select! {
                _ = ticker.tick() => None,
                msg = &mut stop_monitor_rx => Some(msg.map(|r| r.client_run_times).unwrap_or_default()),
            }
        });

        let interval = stats_state.drain();
        for (sum, n) in per_client_total_writes.iter_mut().zip(&interval.writes_per_client) {
            *sum += n;
        }
        this_round.add(&interval);
        total.add(&interval);

        let server_cpu_usage = stats_state.server_cpu_usage();
        info!("{}", this_round.summary_since_start(server_cpu_usage.clone()));
        let total_summary = total.summary_since_start(server_cpu_usage);
        info!("{total_summary}");
        total_summaries.push(total_summary);

        if let Some(client_run_times) = exit {
            break client_run_times;
        }
    };

    info!("monitor shutting down");

    // per-client totals show fairness in time-bounded runs
    let output = BenchmarkOutput {
        args: args.as_ref().clone(),
        sorted_per_client_total_writes: per_client_total_writes.into_iter().sorted().collect(),
        sorted_per_client_runtimes_secs: client_run_times
            .iter()
            .sorted()
            .map(|d| d.as_secs_f64())
            .collect(),
        totals: total_summaries,
    };
    info!("writing results to {OUTPUT_PATH}");
    if let Err(e) = write_output(OUTPUT_PATH.as_ref(), &output) {
        error!("cannot write {OUTPUT_PATH}: {e}");
    }

    info!("total: {}", total.summary_since_start(stats_state.server_cpu_usage()));
}
