use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};

use market_data_pcap::config::{PollMode, ProcessorConfig};
use market_data_pcap::logging;
use market_data_pcap::processor::PcapProcessor;
use market_data_pcap::sink::{BookSink, CsvSink, EventLogSink};

const EVENT_LOG_FILE: &str = "events.bin";

#[derive(Debug, Parser)]
#[command(version, about = "Decode a market-data feed from a packet capture")]
struct Args {
    /// Capture file to analyze (.pcap)
    #[arg(long, short = 'f', env = "PCAP_FILE")]
    file: PathBuf,

    /// Directory for CSV files and the event log
    #[arg(long, env = "OUT_DIR", default_value = "out")]
    out_dir: PathBuf,

    /// Write order updates, executions and snapshot levels as CSV
    #[arg(long, env = "CSV", default_value_t = false)]
    csv: bool,

    /// Write a framed event log (replay it with `player`)
    #[arg(long, env = "EVENT_LOG", default_value_t = false)]
    event_log: bool,

    /// Read chunk size in MiB; must hold the largest packet record
    #[arg(long, env = "CHUNK_MB", default_value_t = 16)]
    chunk_mb: usize,

    /// Bound the batch queue (unbounded when omitted)
    #[arg(long, env = "QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Consumer sleep between empty polls, in microseconds
    #[arg(long, env = "POLL_INTERVAL_US", default_value_t = 1000)]
    poll_interval_us: u64,

    /// Block on the batch queue instead of polling
    #[arg(long, env = "BLOCKING", default_value_t = false)]
    blocking: bool,

    /// Levels per side printed for each book at the end
    #[arg(long, env = "BOOK_DEPTH", default_value_t = 5)]
    book_depth: usize,

    /// Default log level when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "JSON_LOGS", default_value_t = false)]
    json_logs: bool,
}

impl Args {
    fn processor_config(&self) -> ProcessorConfig {
        let poll = if self.blocking {
            PollMode::Blocking
        } else {
            PollMode::Sleep(Duration::from_micros(self.poll_interval_us))
        };
        ProcessorConfig::default()
            .with_chunk_size(self.chunk_mb.saturating_mul(1024 * 1024))
            .with_queue_capacity(self.queue_capacity)
            .with_poll(poll)
    }
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    logging::init(&args.log_level, args.json_logs);

    let processor = PcapProcessor::open(&args.file, args.processor_config())
        .with_context(|| format!("open capture {:?}", args.file))?;

    // Ctrl+C ends buffering after the current chunk; queued batches still get decoded.
    let stop = processor.stop_signal();
    if let Err(e) = ctrlc::set_handler(move || stop.stop()) {
        warn!(error = %e, "cannot install Ctrl+C handler");
    }

    let csv = if args.csv {
        Some(CsvSink::create(&args.out_dir).context("create CSV outputs")?)
    } else {
        None
    };
    let events = if args.event_log {
        let path = args.out_dir.join(EVENT_LOG_FILE);
        Some(EventLogSink::create(path, &args.file, processor.header().link_type)?)
    } else {
        None
    };

    let report = processor
        .run((csv, (events, BookSink::new())))
        .with_context(|| format!("process {:?}", args.file))?;
    let (csv, (events, books)) = report.sink;

    if let Some(csv) = csv {
        let rows = csv.finish().context("finish CSV outputs")?;
        info!(rows, dir = %args.out_dir.display(), "CSV written");
    }
    if let Some(events) = events {
        let path = events.path().to_path_buf();
        let written = events.finish().context("finish event log")?;
        info!(events = written, path = %path.display(), "event log written");
    }

    println!("{}", report.summary);
    for (security_id, book) in books.books().iter() {
        println!(
            "security {} ({} orders, rpt_seq {}) | top{} bids / asks:",
            security_id,
            book.order_count(),
            book.last_rpt_seq(),
            args.book_depth
        );
        print!("{}", book.render_top(args.book_depth));
        println!("---");
    }
    Ok(())
}
