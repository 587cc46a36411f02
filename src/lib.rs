//! Offline market-data feed reconstruction from packet captures.
//!
//! This crate provides the core types and logic used by the `market_data_pcap`
//! analyzer binary and the `player` tool:
//!
//! - `pcap` / `buffer`: capture-file reading, with a producer thread that
//!   batches whole packet records in capture order
//! - `frame` / `pipeline`: Ethernet, IPv4 and UDP header stripping; non-UDP
//!   packets are skipped
//! - `protocol` / `decoder`: the exchange's binary wire protocol (envelope,
//!   order updates, executions, order book snapshots) dispatched to a
//!   [`decoder::MessageSink`]
//! - `book`: snapshot books and live per-security order books
//! - `processor`: the end-to-end run over one capture file
//! - `record` / `sink`: CSV output and a framed, CRC-checked event log
//!
//! ```no_run
//! use market_data_pcap::config::ProcessorConfig;
//! use market_data_pcap::processor::PcapProcessor;
//! use market_data_pcap::sink::BookSink;
//!
//! let processor = PcapProcessor::open("feed.pcap", ProcessorConfig::default())?;
//! let report = processor.run(BookSink::new())?;
//! println!("{}", report.summary);
//! # Ok::<(), market_data_pcap::error::CaptureError>(())
//! ```
pub mod book;
pub mod buffer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pcap;
pub mod pipeline;
pub mod processor;
pub mod protocol;
pub mod record;
pub mod sink;
