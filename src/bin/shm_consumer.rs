//! Shared-memory consumer tool
//!
//! Attaches to one channel's ring and prints every frame it reads, or only
//! periodic statistics. Frames can be appended to a file, which for H.264
//! channels yields a playable Annex-B stream.
//!
//! Run with: cargo run --bin shm_consumer -- [OPTIONS]
//!
//! Examples:
//!   shm_consumer                         # channel 0, print frames
//!   shm_consumer -C 2 -s                 # channel 2, statistics only
//!   shm_consumer -c 300 -o capture.h264  # save 300 frames
//!   ffplay capture.h264

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use camstream::channel::ChannelId;
use camstream::error::ShmError;
use camstream::frame::LatestFrame;
use camstream::shm::{ConsumerHandle, ShmConfig};

/// Longest single wait, so a stop request is noticed promptly
const POLL: Duration = Duration::from_millis(200);

/// Statistics period in `--stats-only` mode, in frames
const STATS_EVERY: u64 = 30;

#[derive(Debug, Parser)]
#[command(name = "shm_consumer", version, about = "Read frames from a camstream shared-memory channel")]
struct Args {
    /// Channel to attach to (0, 1 or 2)
    #[arg(short = 'C', long, default_value = "0", value_parser = parse_channel)]
    channel: ChannelId,

    /// Print statistics only (no per-frame lines)
    #[arg(short, long)]
    stats_only: bool,

    /// Exit after this many frames (0 = run until stopped)
    #[arg(short, long, default_value_t = 0)]
    count: u64,

    /// Report a timeout when no frame arrives for this long, in
    /// milliseconds (0 = wait indefinitely)
    #[arg(short, long, default_value_t = 0)]
    timeout_ms: u64,

    /// Append raw frame payloads to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Shared-memory name namespace used by the producer
    #[arg(long)]
    namespace: Option<String>,

    /// Keep retrying until a producer appears
    #[arg(short, long)]
    wait: bool,
}

fn parse_channel(s: &str) -> Result<ChannelId, String> {
    ChannelId::parse_selector(s).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let running = Arc::new(AtomicBool::new(true));
    if let Err(e) = ctrlc::set_handler({
        let running = Arc::clone(&running);
        move || {
            running.store(false, Ordering::SeqCst);
        }
    }) {
        eprintln!("ERROR: failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&args, &running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, running: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let mut shm = ShmConfig::default();
    if let Some(ns) = &args.namespace {
        shm = shm.namespace(ns);
    }

    println!("Shared-memory consumer");
    println!("======================");
    println!("Channel: {} ({})", args.channel, shm.segment_name(args.channel));
    if args.count > 0 {
        println!("Will exit after {} frames", args.count);
    }
    if args.timeout_ms > 0 {
        println!("Timeout: {} ms", args.timeout_ms);
    }
    println!();

    let Some(mut consumer) = attach(args, &shm, running)? else {
        return Ok(());
    };
    println!("Connected. Press Ctrl+C to stop\n");

    let mut output = match &args.output {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            println!("Saving frames to: {}\n", path.display());
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));
    let mut last_frame = Instant::now();
    let mut received: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let frame = match consumer.wait_and_read(Some(POLL)) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if let Some(timeout) = timeout {
                    if last_frame.elapsed() >= timeout {
                        println!("Timeout waiting for frame");
                        last_frame = Instant::now();
                    }
                }
                continue;
            }
            Err(ShmError::ChannelUnavailable) => {
                println!("\nProducer is gone, stopping");
                break;
            }
            Err(e @ ShmError::CorruptSlot { .. }) => {
                tracing::warn!(channel = %args.channel, error = %e, "Skipped corrupt slot");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        last_frame = Instant::now();
        received += 1;

        if !args.stats_only {
            print_frame(&frame, received);
        }
        if let Some(out) = output.as_mut() {
            out.write_all(&frame.payload)?;
        }

        if args.count > 0 && received >= args.count {
            println!("\nReached maximum frame count ({})", args.count);
            break;
        }
        if args.stats_only && received % STATS_EVERY == 0 {
            print_stats(&consumer);
        }
    }

    print_stats(&consumer);
    println!("Total frames received: {}", received);

    if let Some(mut out) = output {
        out.flush()?;
        if let Some(path) = &args.output {
            println!("Saved to: {}", path.display());
        }
    }

    consumer.detach();
    Ok(())
}

/// Attach, retrying while no producer exists if `--wait` was given
fn attach(
    args: &Args,
    shm: &ShmConfig,
    running: &AtomicBool,
) -> Result<Option<ConsumerHandle>, ShmError> {
    loop {
        match ConsumerHandle::attach(args.channel, shm) {
            Ok(consumer) => return Ok(Some(consumer)),
            Err(e) if args.wait && e.is_retryable() => {
                tracing::debug!(channel = %args.channel, error = %e, "Producer not ready, retrying");
                if !running.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => {
                if e.is_retryable() {
                    eprintln!("Is camstream running? (use --wait to keep retrying)");
                }
                return Err(e);
            }
        }
    }
}

fn print_frame(frame: &LatestFrame, n: u64) {
    let meta = &frame.meta;
    println!(
        "[Frame {}] seq={}, size={} bytes, {}, {}, {}x{}@{}fps, ts={} ms{}",
        n,
        meta.sequence,
        meta.payload_size,
        meta.codec,
        if meta.is_keyframe { "I-frame" } else { "P-frame" },
        meta.width,
        meta.height,
        meta.fps,
        meta.capture_timestamp_ms,
        if frame.missed > 0 {
            format!(" (missed {})", frame.missed)
        } else {
            String::new()
        },
    );
}

fn print_stats(consumer: &ConsumerHandle) {
    let stats = consumer.stats();
    let total = u64::from(stats.frame_count);
    let percent = |n: u64| if total > 0 { 100.0 * n as f64 / total as f64 } else { 0.0 };

    println!("\n=== Statistics ===");
    println!("Total frames:   {}", total);
    println!(
        "Dropped frames: {} ({:.2}%)",
        stats.dropped_frames,
        percent(u64::from(stats.dropped_frames))
    );
    println!(
        "Missed frames:  {} ({:.2}%)",
        stats.missed_frames,
        percent(stats.missed_frames)
    );
    println!("Readers:        {}", stats.active_readers);
    println!("==================");
}
