//! Export of gathered flow tables: IPFIX datagrams to a collector, or
//! CSV snapshots for debugging.

pub mod csv_snapshot;
pub mod ipfix;

use crate::flow::FlowTable;
use anyhow::Context;
use std::net::SocketAddr;

pub use csv_snapshot::SnapshotSender;
pub use ipfix::PacketSender;

/// One export destination. Export I/O failures are logged, never fatal.
pub trait FlowSender {
    fn send(&mut self, flows: &FlowTable, cutoff_ns: u64);
}

/// Build the exporter selected by the collector flag: the literal
/// `stdout` means CSV snapshots, anything else is parsed as a UDP
/// collector address (`IPv4:port` or `[IPv6]:port`).
pub fn build_sender(collector: &str) -> anyhow::Result<Box<dyn FlowSender>> {
    if collector == "stdout" {
        return Ok(Box::new(SnapshotSender::new(std::io::stdout())));
    }
    let addr: SocketAddr = collector
        .parse()
        .with_context(|| format!("Unable to parse collector address '{collector}'"))?;
    Ok(Box::new(PacketSender::connect(addr)?))
}
