//! The push/pull packet ports and the forward-direction sampling gate.

use rand::Rng;

use zoom_core::{CountMode, Monitor};

use crate::ip::{IpHeaderView, PacketError};

/// The minimal surface the element needs from a host's real packet type:
/// read-only access to the bytes carrying the IP header, and a writable
/// annotation byte (spec.md §1, §6). A host adapter implements this over
/// its own `Packet`; tests use a `Vec<u8>`-backed struct.
pub trait PacketLike {
    /// The packet's bytes, including everything before the configured
    /// IPv4 header offset.
    fn bytes(&self) -> &[u8];

    /// Stamp the packet's annotation byte.
    fn set_annotation(&mut self, byte: u8);
}

/// Feed one packet arriving on `push`, from input port 0 (`forward`) or
/// port 1 (reverse). Applies the ratio-based sampling gate to the
/// forward-direction update only; reverse-direction traffic is always
/// sampled on `push` (spec.md §4.3's `ratio` is scoped to "forward-
/// direction EWMA updates").
///
/// A parse failure forwards the packet unchanged and touches no monitor
/// state (spec.md §7).
pub fn push<P: PacketLike>(
    monitor: &Monitor,
    packet: &mut P,
    forward: bool,
    tick: u64,
) -> Result<(), PacketError> {
    let header = IpHeaderView::parse(packet.bytes(), monitor.offset())?;
    let sample = sample_value(monitor, &header);
    let do_ewma = if forward { sample_gate(monitor.ratio_raw()) } else { true };
    let outcome = monitor.update_rates(header.src, header.dst, sample, forward, do_ewma, tick);
    if let Some(level) = outcome.annotate_level {
        if monitor.annotate_enabled() {
            packet.set_annotation(level + 1);
        }
    }
    Ok(())
}

/// Feed one packet arriving on `pull`. Every pulled packet is a sample
/// regardless of `ratio` (spec.md §4.3).
pub fn pull<P: PacketLike>(
    monitor: &Monitor,
    packet: &mut P,
    forward: bool,
    tick: u64,
) -> Result<(), PacketError> {
    let header = IpHeaderView::parse(packet.bytes(), monitor.offset())?;
    let sample = sample_value(monitor, &header);
    let outcome = monitor.update_rates(header.src, header.dst, sample, forward, true, tick);
    if let Some(level) = outcome.annotate_level {
        if monitor.annotate_enabled() {
            packet.set_annotation(level + 1);
        }
    }
    Ok(())
}

fn sample_value(monitor: &Monitor, header: &IpHeaderView) -> i64 {
    match monitor.count_mode() {
        CountMode::Packets => 1,
        CountMode::Bytes => header.total_len as i64,
    }
}

/// Draw a forward-direction sample with probability `ratio_raw / 65536`.
fn sample_gate(ratio_raw: u32) -> bool {
    if ratio_raw >= 1 << 16 {
        return true;
    }
    rand::thread_rng().gen_range(0..(1u32 << 16)) < ratio_raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use zoom_core::MonitorConfig;

    struct TestPacket {
        buf: Vec<u8>,
        annotation: u8,
    }

    impl PacketLike for TestPacket {
        fn bytes(&self) -> &[u8] {
            &self.buf
        }
        fn set_annotation(&mut self, byte: u8) {
            self.annotation = byte;
        }
    }

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> TestPacket {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        TestPacket { buf, annotation: 0 }
    }

    fn monitor(threshold: u32) -> Monitor {
        let cfg = MonitorConfig::from_toml_str(&format!(
            "type = \"PACKETS\"\noffset = 0\nratio = 1.0\nthreshold = {threshold}\nmemmax = 0\nannotate = false"
        ))
        .unwrap();
        Monitor::new(&cfg, 1000).unwrap()
    }

    #[test]
    fn malformed_packet_is_rejected_without_touching_state() {
        let m = monitor(1);
        let before = m.mem();
        let mut p = TestPacket { buf: vec![0u8; 5], annotation: 0 };
        let err = push(&m, &mut p, true, 1).unwrap_err();
        assert!(matches!(err, PacketError::TooShort { .. }));
        assert_eq!(m.mem(), before);
    }

    #[test]
    fn push_updates_tree() {
        let m = monitor(1);
        let mut p = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        for t in 0..20u64 {
            push(&m, &mut p, true, t).unwrap();
        }
        assert!(m.node_count() > 0);
    }

    #[test]
    fn full_ratio_always_samples() {
        assert!(sample_gate(1 << 16));
    }

    #[test]
    fn push_stamps_annotation_byte_while_a_rule_is_active() {
        let cfg = MonitorConfig::from_toml_str(
            "type = \"PACKETS\"\noffset = 0\nratio = 1.0\nthreshold = 1\nmemmax = 0\nannotate = true",
        )
        .unwrap();
        let m = Monitor::new(&cfg, 1000).unwrap();
        m.set_anno_level([10, 0, 0, 0], 2, 5).unwrap();

        let mut p = ipv4_packet([10, 0, 0, 7], [192, 168, 0, 1]);
        push(&m, &mut p, true, 1).unwrap();
        assert_eq!(p.annotation, 3, "annotation byte should be level index (2) + 1");

        let mut p = ipv4_packet([10, 0, 0, 7], [192, 168, 0, 1]);
        push(&m, &mut p, true, 5).unwrap();
        assert_eq!(p.annotation, 0, "annotation must not fire once the deadline tick is reached");
    }
}
