//! The named handler table (spec.md §4.4, §6).

use std::sync::Arc;

use zoom_core::Monitor;

use crate::error::HandlerError;

/// A registry of named read/write endpoints over a shared monitor,
/// mirroring the host's handler-registration contract: `thresh`, `look`,
/// `mem` and `memmax` are readable; `memmax`, `anno_level` and `reset`
/// are writable; `memmax` is both. Unlike a plain string-keyed map, read
/// and write live in separate namespaces so a single name can support
/// both directions, per spec.md §6's per-row `Dir` column.
pub struct HandlerTable {
    monitor: Arc<Monitor>,
}

impl HandlerTable {
    /// Build a handler table over a shared monitor.
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }

    /// Dispatch a read handler by name.
    pub fn read(&self, name: &str, tick: u64) -> Result<String, HandlerError> {
        match name {
            "thresh" => Ok(format!("{}\n", self.monitor.thresh())),
            "look" => Ok(self.monitor.look(tick)),
            "mem" => Ok(format!("{}\n", self.monitor.mem())),
            "memmax" => Ok(format!("{}\n", self.monitor.memmax())),
            "anno_level" | "reset" => {
                Err(HandlerError::WrongDirection { name: name.to_string(), dir: "read" })
            }
            other => Err(HandlerError::UnknownHandler(other.to_string())),
        }
    }

    /// Dispatch a write handler by name with its raw argument string.
    pub fn write(&self, name: &str, args: &str, tick: u64) -> Result<(), HandlerError> {
        match name {
            "memmax" => {
                let kib: u32 = args.trim().parse().map_err(|_| HandlerError::BadArgument {
                    name: name.to_string(),
                    detail: format!("expected an integer KiB count, got {args:?}"),
                })?;
                self.monitor.set_memmax_kib(kib, tick);
                tracing::info!(kib, "memmax reconfigured");
                Ok(())
            }
            "anno_level" => {
                let (ip, level, seconds) = parse_anno_args(name, args)?;
                let until_tick = tick + seconds * self.monitor.freq() as u64;
                self.monitor.set_anno_level(ip, level, until_tick)?;
                tracing::debug!(?ip, level, seconds, "annotation rule activated");
                Ok(())
            }
            "reset" => {
                self.monitor.reset(tick);
                tracing::info!("monitor reset");
                Ok(())
            }
            "thresh" | "look" | "mem" => {
                Err(HandlerError::WrongDirection { name: name.to_string(), dir: "write" })
            }
            other => Err(HandlerError::UnknownHandler(other.to_string())),
        }
    }

    /// A single entry point covering both directions: `args = None` is a
    /// read, `args = Some(_)` is a write. Lets a REPL or future host
    /// binding share one dispatch path instead of matching handler names
    /// twice.
    pub fn dispatch(&self, name: &str, args: Option<&str>, tick: u64) -> Result<String, HandlerError> {
        match args {
            None => self.read(name, tick),
            Some(args) => {
                self.write(name, args, tick)?;
                Ok(String::new())
            }
        }
    }
}

fn parse_anno_args(name: &str, args: &str) -> Result<([u8; 4], u8, u64), HandlerError> {
    let bad = |detail: String| HandlerError::BadArgument { name: name.to_string(), detail };
    let mut parts = args.split_whitespace();
    let ip_str = parts.next().ok_or_else(|| bad("missing ip argument".to_string()))?;
    let level_str = parts.next().ok_or_else(|| bad("missing level argument".to_string()))?;
    let seconds_str = parts.next().ok_or_else(|| bad("missing seconds argument".to_string()))?;
    if parts.next().is_some() {
        return Err(bad("expected exactly 3 arguments: ip level seconds".to_string()));
    }

    let octets: Vec<&str> = ip_str.split('.').collect();
    if octets.len() != 4 {
        return Err(bad(format!("{ip_str:?} is not a dotted IPv4 address")));
    }
    let mut ip = [0u8; 4];
    for (slot, octet) in ip.iter_mut().zip(octets) {
        *slot = octet.parse().map_err(|_| bad(format!("invalid octet {octet:?} in {ip_str:?}")))?;
    }

    let level: u8 = level_str.parse().map_err(|_| bad(format!("invalid level {level_str:?}")))?;
    if level > 3 {
        return Err(bad(format!("level {level} out of range 0..=3")));
    }

    let seconds: u64 = seconds_str.parse().map_err(|_| bad(format!("invalid seconds {seconds_str:?}")))?;
    if seconds == 0 {
        return Err(bad("seconds must be >= 1".to_string()));
    }

    Ok((ip, level, seconds))
}
