//! Zoom Element
//!
//! The packet-processing element: parses the IPv4 header at a configurable
//! offset, applies the forward-direction sampling ratio, and drives
//! `zoom-core`'s monitor from the push/pull port contract.

mod element;
mod ip;

pub use element::{pull, push, PacketLike};
pub use ip::{IpHeaderView, PacketError};
