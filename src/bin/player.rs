use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use market_data_pcap::book::{Books, OrderBookSnapshot};
use market_data_pcap::protocol::{OrderBookEntry, OrderBookSnapshotHeader, normalize_price};
use market_data_pcap::record::{EventKind, EventRecord, RecordFrame, read_frame};
use market_data_pcap::sink::format_sending_time;

#[derive(Debug, Parser)]
#[command(about = "Play a recorded event log and reconstruct the books")]
struct Args {
    /// Event log to read (written by `market_data_pcap --event-log`)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Dump top-of-book after each event
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Number of levels to print when dumping
    #[arg(long, default_value_t = 5)]
    top: usize,

    /// Print every event as it is read
    #[arg(long, default_value_t = false)]
    print_events: bool,
}

fn print_event(ev: &EventRecord) {
    let when = format_sending_time(ev.envelope.sending_time);
    match &ev.kind {
        EventKind::OrderUpdate(u) => println!(
            "UPDATE seq={} msg={} ts={} sec={} id={} {} {} price={} qty={}",
            ev.seq,
            ev.envelope.sequence_number,
            when,
            u.security_id,
            u.order_id,
            u.action,
            u.side,
            u.price(),
            u.order_volume
        ),
        EventKind::OrderExecution(e) => println!(
            "EXEC seq={} msg={} ts={} sec={} id={} {} {} price={} remaining={} trade_price={} trade_qty={}",
            ev.seq,
            ev.envelope.sequence_number,
            when,
            e.security_id,
            e.order_id,
            e.action,
            e.side,
            e.price(),
            e.remaining_quantity,
            e.trade_price(),
            e.trade_volume
        ),
        EventKind::OrderBookSnapshot { header, bids, asks } => println!(
            "SNAPSHOT seq={} msg={} ts={} sec={} rpt_seq={} bids={} asks={} best_bid={} best_ask={}",
            ev.seq,
            ev.envelope.sequence_number,
            when,
            header.security_id,
            header.rpt_seq,
            bids.len(),
            asks.len(),
            bids.first().map(|e| normalize_price(e.order_price)).unwrap_or(f64::NAN),
            asks.first().map(|e| normalize_price(e.order_price)).unwrap_or(f64::NAN)
        ),
    }
}

fn rebuild_snapshot(
    header: &OrderBookSnapshotHeader,
    bids: &[OrderBookEntry],
    asks: &[OrderBookEntry],
) -> OrderBookSnapshot {
    let mut snapshot = OrderBookSnapshot::new(*header);
    for entry in bids.iter().chain(asks) {
        snapshot.insert(*entry);
    }
    snapshot
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file = File::open(&args.input).with_context(|| format!("open {:?}", args.input))?;
    let mut rdr = BufReader::new(file);
    let mut books = Books::new();
    let mut frames = 0usize;

    while let Some(frame) = read_frame(&mut rdr).with_context(|| format!("frame {frames}"))? {
        frames += 1;
        match frame {
            RecordFrame::Header(h) => {
                if frames != 1 {
                    bail!("unexpected header at frame {frames}");
                }
                if args.dump {
                    eprintln!(
                        "Header: v{} source={} link_type={} created={}ns",
                        h.version, h.source, h.link_type, h.created_unix_ns
                    );
                }
            }
            RecordFrame::Event(ev) => {
                if args.print_events {
                    print_event(&ev);
                }
                let security_id = match &ev.kind {
                    EventKind::OrderUpdate(u) => {
                        books.apply_update(u);
                        u.security_id
                    }
                    EventKind::OrderExecution(e) => {
                        books.apply_execution(e);
                        e.security_id
                    }
                    EventKind::OrderBookSnapshot { header, bids, asks } => {
                        let snapshot = rebuild_snapshot(header, bids, asks);
                        books.apply_snapshot(&ev.envelope, &snapshot);
                        header.security_id
                    }
                };
                if args.dump {
                    if let Some(book) = books.get(security_id) {
                        println!(
                            "seq={} security={} | top{} bids / asks:",
                            ev.seq, security_id, args.top
                        );
                        print!("{}", book.render_top(args.top));
                        println!("---");
                    }
                }
            }
        }
    }
    let orders: usize = books.iter().map(|(_, b)| b.order_count()).sum();
    eprintln!(
        "Read {} frames. Final state: {} books, {} resting orders.",
        frames,
        books.len(),
        orders
    );
    Ok(())
}
