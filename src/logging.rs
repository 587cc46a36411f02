//! Tracing subscriber setup and the packet hex dump used at trace level.
use std::fmt::Write as _;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

static INIT: Once = Once::new();

/// Install the global subscriber once. `RUST_LOG`, when set, wins over `level`.
/// Logs go to stderr so stdout stays free for reports.
pub fn init(level: &str, json: bool) {
    let level = match level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    };

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false);
        let installed = if json {
            builder.json().with_thread_names(true).try_init()
        } else {
            builder.with_thread_names(true).try_init()
        };
        if installed.is_ok() {
            tracing::debug!(%level, json, "logging initialized");
        }
    });
}

/// Classic 16-bytes-per-line dump: offset, hex bytes, printable ASCII.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(16) * 76);
    for (line, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {b:02x}");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' }
        }));
        out.push_str("|\n");
    }
    out
}
