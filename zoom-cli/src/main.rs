//! Zoom CLI
//!
//! A line-oriented REPL over a `zoom-core` monitor, driven through
//! `zoom-handlers`. The clock is virtual: a `tick` command advances it
//! explicitly, so sessions are reproducible without waiting on wall time.

#![deny(missing_docs)]

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use zoom_core::{Monitor, MonitorConfig};
use zoom_element::PacketLike;
use zoom_handlers::HandlerTable;

const DEFAULT_CONFIG: &str = r#"
type = "PACKETS"
offset = 0
ratio = 1.0
threshold = 100
memmax = 0
annotate = true
"#;

/// An in-memory IPv4 packet used to exercise `push`/`pull` from the REPL.
struct ReplPacket {
    buf: Vec<u8>,
    annotation: u8,
}

impl ReplPacket {
    fn new(src: [u8; 4], dst: [u8; 4], total_len: u16) -> Self {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        Self { buf, annotation: 0 }
    }
}

impl PacketLike for ReplPacket {
    fn bytes(&self) -> &[u8] {
        &self.buf
    }
    fn set_annotation(&mut self, byte: u8) {
        self.annotation = byte;
    }
}

/// The primary entrypoint: loads a monitor configuration from the first
/// argument (a TOML path) or falls back to a small built-in default, then
/// reads commands from stdin until EOF.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => MonitorConfig::from_toml_path(std::path::Path::new(&path))?,
        None => {
            tracing::info!("no config path given, using built-in defaults");
            MonitorConfig::from_toml_str(DEFAULT_CONFIG)?
        }
    };

    let monitor = Arc::new(Monitor::new(&config, 1)?);
    let handlers = HandlerTable::new(Arc::clone(&monitor));
    let tick = AtomicU64::new(0);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("zoom> ");
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        let now = tick.load(Ordering::SeqCst);
        match run_command(&monitor, &handlers, &tick, &line, now) {
            Ok(Some(out)) => print!("{out}"),
            Ok(None) => {}
            Err(e) => println!("error: {e}"),
        }
        print!("zoom> ");
        stdout.flush()?;
    }
    println!();
    Ok(())
}

fn run_command(
    monitor: &Monitor,
    handlers: &HandlerTable,
    tick: &AtomicU64,
    line: &str,
    now: u64,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else { return Ok(None) };

    match cmd {
        "quit" | "exit" => std::process::exit(0),
        "tick" => {
            let step: u64 = words.next().map(|s| s.parse::<u64>()).transpose()?.unwrap_or(1);
            tick.fetch_add(step.max(1), Ordering::SeqCst);
            Ok(None)
        }
        "read" => {
            let name = words.next().ok_or("usage: read <name>")?;
            Ok(Some(handlers.read(name, now)?))
        }
        "write" => {
            let name = words.next().ok_or("usage: write <name> [args...]")?;
            let args: Vec<&str> = words.collect();
            handlers.write(name, &args.join(" "), now)?;
            Ok(None)
        }
        "push" | "pull" => {
            let src = parse_ip(words.next().ok_or("usage: push <src> <dst> <forward:0|1>")?)?;
            let dst = parse_ip(words.next().ok_or("usage: push <src> <dst> <forward:0|1>")?)?;
            let forward = words.next().ok_or("usage: push <src> <dst> <forward:0|1>")? != "0";
            let mut packet = ReplPacket::new(src, dst, 1500);
            if cmd == "push" {
                zoom_element::push(monitor, &mut packet, forward, now)?;
            } else {
                zoom_element::pull(monitor, &mut packet, forward, now)?;
            }
            Ok(Some(format!("annotation={}\n", packet.annotation)))
        }
        other => Err(format!("unknown command {other:?}").into()),
    }
}

fn parse_ip(s: &str) -> Result<[u8; 4], Box<dyn std::error::Error>> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return Err(format!("{s:?} is not a dotted IPv4 address").into());
    }
    let mut out = [0u8; 4];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part.parse()?;
    }
    Ok(out)
}
