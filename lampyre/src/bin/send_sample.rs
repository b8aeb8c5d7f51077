//! Sends a synthetic feed at a daemon, for smoke-testing a deployment
//! without a camera: handshake, then JPEG-shaped frames at a fixed rate.

use std::{net::SocketAddr, process::ExitCode, time::Duration};

use clap::Parser;
use lampyre::FeedTransmitter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "send-sample", version, about)]
struct Args {
    /// Control endpoint of the daemon, e.g. 192.168.101.129:56789.
    control: SocketAddr,

    /// Feed identifier to announce.
    #[arg(long, default_value = "TEST_STREAM")]
    identifier: String,

    /// Frames per second to send.
    #[arg(long, default_value_t = 10)]
    fps: u32,

    /// Number of frames to send; 0 means until interrupted.
    #[arg(long, default_value_t = 0)]
    count: u64,

    /// Size of each synthetic frame in bytes.
    #[arg(long, default_value_t = 9000)]
    frame_size: usize,
}

/// A JPEG-shaped frame: correct start/end markers around filler that varies
/// per frame, so a viewer can tell frames apart.
fn synthetic_frame(size: usize, sequence: u64) -> Vec<u8> {
    let size = size.max(4);
    let mut frame = vec![sequence as u8; size];
    frame[0] = 0xFF;
    frame[1] = 0xD8;
    frame[size - 2] = 0xFF;
    frame[size - 1] = 0xD9;
    frame
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut transmitter = match FeedTransmitter::handshake(args.control, &args.identifier).await {
        Ok(transmitter) => transmitter,
        Err(error) => {
            error!(%error, "handshake failed");
            return ExitCode::FAILURE;
        }
    };
    info!(
        identifier = transmitter.identifier(),
        ingest = %transmitter.ingest_addr(),
        "authenticated, sending frames"
    );

    let period = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
    let mut sent = 0u64;
    loop {
        if args.count != 0 && sent >= args.count {
            break;
        }
        let frame = synthetic_frame(args.frame_size, sent);
        if let Err(error) = transmitter.send_frame(&frame).await {
            error!(%error, "failed to send frame");
            return ExitCode::FAILURE;
        }
        sent += 1;
        tokio::time::sleep(period).await;
    }

    info!(sent, "done");
    ExitCode::SUCCESS
}
