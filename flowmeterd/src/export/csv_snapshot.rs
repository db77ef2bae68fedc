//! CSV snapshot export: one debug row per flow with activity.

use super::FlowSender;
use crate::flow::{EndReason, FlowTable};
use log::error;
use std::io::Write;

const HEADER: [&str; 14] = [
    "FlowStart",
    "FlowEnd",
    "SrcIP",
    "DstIP",
    "SrcPort",
    "DstPort",
    "VLAN",
    "TOS",
    "Protocol",
    "ICMPType",
    "ICMPCode",
    "Bytes",
    "Packets",
    "FlowEndReason",
];

/// Writes each exported flow table as a header line plus one row per
/// flow, to stdout or any other writer.
pub struct SnapshotSender<W: Write> {
    out: W,
}

impl<W: Write> SnapshotSender<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Epoch nanoseconds as decimal seconds with full precision.
fn format_seconds(ns: u64) -> String {
    format!("{}.{:09}", ns / 1_000_000_000, ns % 1_000_000_000)
}

impl<W: Write> FlowSender for SnapshotSender<W> {
    fn send(&mut self, flows: &FlowTable, cutoff_ns: u64) {
        let mut writer = csv::Writer::from_writer(&mut self.out);
        if let Err(e) = writer.write_record(HEADER) {
            error!("Writing CSV snapshot header failed: {e}");
            return;
        }
        for (key, stats) in flows {
            let end_reason = stats.end_reason(cutoff_ns);
            if stats.packets == 0 && end_reason == EndReason::ActiveTimeout {
                continue;
            }
            let row = [
                format_seconds(stats.first_ns),
                format_seconds(stats.last_ns),
                key.src_addr().to_string(),
                key.dst_addr().to_string(),
                key.src_port.to_string(),
                key.dst_port.to_string(),
                key.vlan.to_string(),
                key.tos.to_string(),
                key.protocol.to_string(),
                key.icmp_type.to_string(),
                key.icmp_code.to_string(),
                stats.bytes.to_string(),
                stats.packets.to_string(),
                (end_reason as u8).to_string(),
            ];
            if let Err(e) = writer.write_record(&row) {
                error!("Writing CSV snapshot row failed: {e}");
                return;
            }
        }
        if let Err(e) = writer.flush() {
            error!("Flushing CSV snapshot failed: {e}");
        }
    }
}
