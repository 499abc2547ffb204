use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, sync::Arc};

use bytes::Bytes;
use disk_write_bench::{
    device::DEFAULT_TEST_RATIO, DeviceConfig, DeviceRange, UtilizationSampler, WriteBenchmarkHandler,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{error, info, warn};

use crate::wire::{self, WireResponse};

#[derive(Clone, Copy, clap::ValueEnum)]
pub(crate) enum DiskAccessKind {
    DirectIo,
    CachedIo,
}

#[derive(clap::Args, Clone)]
pub(crate) struct ServeArgs {
    /// Block device to write to, e.g. /dev/nvme0n1. Everything in the test range gets overwritten.
    device: PathBuf,
    #[clap(long, default_value = "0.0.0.0:8002")]
    listen: SocketAddr,
    /// Size of the test range in bytes. 0 means use --ratio of the device.
    #[clap(long, default_value_t = 0)]
    fixed_size_bytes: u64,
    #[clap(long, default_value_t = DEFAULT_TEST_RATIO)]
    ratio: f64,
    #[clap(long, value_enum, default_value = "direct-io")]
    disk_access: DiskAccessKind,
    /// Prefer a zero-copy hardware transport if the channel supports one.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    prefer_zero_copy: bool,
    /// Upper bound on worker threads, each of which owns one staging buffer.
    #[clap(long, default_value = "512")]
    max_blocking_threads: NonZeroUsize,
    #[clap(long, default_value_t = wire::DEFAULT_MAX_FRAME_BYTES)]
    max_payload_bytes: usize,
}

pub(crate) fn main(args: ServeArgs) {
    let config = DeviceConfig {
        fixed_size_bytes: args.fixed_size_bytes,
        ratio: args.ratio,
        direct_io: match args.disk_access {
            DiskAccessKind::DirectIo => true,
            DiskAccessKind::CachedIo => false,
        },
        ..DeviceConfig::new(&args.device)
    };
    let range = match DeviceRange::open(&config) {
        Ok(range) => range,
        Err(e) => {
            error!("fatal: {e}. Please check permissions and the device name.");
            std::process::exit(1);
        }
    };

    let handler = Arc::new(WriteBenchmarkHandler::with_device(
        range,
        UtilizationSampler::new(),
    ));

    if args.prefer_zero_copy {
        warn!("zero-copy transport requested but not available, serving over tcp");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(args.max_blocking_threads.get())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            info!("ctrl-c, shutting down");
            cancel.cancel();
        }
    })
    .unwrap();

    let res = rt.block_on(async {
        let listener = TcpListener::bind(args.listen).await?;
        info!("listening on {}", listener.local_addr()?);
        serve(listener, Arc::clone(&handler), cancel, args.max_payload_bytes).await
    });
    if let Err(e) = res {
        error!("fatal: {e}");
        std::process::exit(1);
    }
    info!("final metrics: {:?}", handler.metrics());
}

/// Accept connections until `cancel` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    handler: Arc<WriteBenchmarkHandler>,
    cancel: CancellationToken,
    max_payload_bytes: usize,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => res?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            info!(%peer, "connection opened");
            tokio::select! {
                res = serve_connection(stream, handler, max_payload_bytes) => match res {
                    Ok(()) => info!(%peer, "connection closed"),
                    Err(e) => warn!(%peer, "connection failed: {e}"),
                },
                _ = cancel.cancelled() => {}
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<WriteBenchmarkHandler>,
    max_payload_bytes: usize,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, wire::codec(max_payload_bytes));
    while let Some(frame) = framed.next().await {
        let payload = frame?;
        let handler = Arc::clone(&handler);
        // the write blocks, and the staging buffer belongs to whichever blocking thread runs it
        let response = tokio::task::spawn_blocking(move || {
            let (response, res) = handler.test(&payload);
            WireResponse::new(response, res)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        framed
            .send(Bytes::from(serde_json::to_vec(&response)?))
            .await?;
    }
    Ok(())
}
