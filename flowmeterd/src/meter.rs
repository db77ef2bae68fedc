//! Per-worker metering state: applies the header decoder to each packet
//! and aggregates into a private flow table.

use crate::flow::{
    add_to_table, combine_tables, EndReason, FlowKey, FlowStats, FlowTable,
};
use crate::headers::Headers;
use flowmeter_tap::TapPacket;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// One worker's flow table. Deliberately neither `Clone` nor `Copy`:
/// states move between a worker and the coordinator, never duplicate.
#[derive(Default)]
pub struct MeterState {
    flows: FlowTable,
}

impl MeterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The carry-over constructor used at every state swap. Flows still
    /// active at `cutoff_ns` survive with their counters zeroed, so the
    /// next cycle reports only new traffic but keeps `first_ns` and the
    /// idle cutoff working across cycles. Everything else is dropped.
    pub fn rotated_from(old: &MeterState, cutoff_ns: u64) -> Self {
        let mut flows = old.flows.clone();
        flows.retain(|_, stats| {
            stats.end_reason(cutoff_ns) == EndReason::ActiveTimeout
        });
        for stats in flows.values_mut() {
            stats.bytes = 0;
            stats.packets = 0;
            stats.tcp_flags = 0;
        }
        flows.shrink_to_fit();
        debug!("Retained {} flows from previous cycle", flows.len());
        Self { flows }
    }

    /// Meter one captured packet.
    pub fn process(&mut self, pkt: &TapPacket) {
        let headers = Headers::parse(pkt.data);
        let mut key = FlowKey::default();
        let mut stats = FlowStats::for_packet(pkt.orig_len as u64, 1, pkt.timestamp_ns);

        // Layer 2-ish: the VLAN comes from tap metadata, not the parse.
        if let Some(tci) = pkt.vlan_tci {
            key.vlan = tci;
        }

        // Layer 3
        if let Some(ip4) = &headers.ip4 {
            key.set_src_ip4(ip4.saddr());
            key.set_dst_ip4(ip4.daddr());
            key.protocol = ip4.protocol();
            key.tos = ip4.tos() >> 2;
        } else if let Some(ip6) = &headers.ip6 {
            key.protocol = ip6.next_header();
            key.set_src_ip6(ip6.saddr());
            key.set_dst_ip6(ip6.daddr());
            key.tos = ((ip6.flow_word() & 0x0FC0_0000) >> 22) as u8;
        }

        // Layer 4
        if let Some(tcp) = &headers.tcp {
            key.src_port = tcp.source();
            key.dst_port = tcp.dest();
            stats.tcp_flags = tcp.flags();
        } else if let Some(udp) = &headers.udp {
            key.src_port = udp.source();
            key.dst_port = udp.dest();
        } else if let Some(icmp4) = &headers.icmp4 {
            key.icmp_type = icmp4.icmp_type();
            key.icmp_code = icmp4.icmp_code();
        } else if let Some(icmp6) = &headers.icmp6 {
            key.icmp_type = icmp6.icmp_type();
            key.icmp_code = icmp6.icmp_code();
        }

        add_to_table(&mut self.flows, key, stats);
    }

    /// Fold another state's flows into this one.
    pub fn merge(&mut self, other: MeterState) {
        debug!(
            "Adding {} flows into {}",
            other.flows.len(),
            self.flows.len()
        );
        combine_tables(&mut self.flows, other.flows);
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn flows_mut(&mut self) -> &mut FlowTable {
        &mut self.flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Builds fresh states for workers, either empty (thread start) or by
/// rotating a previous state at the cutoff the coordinator set for this
/// gather cycle.
#[derive(Default)]
pub struct MeterFactory {
    cutoff_ns: AtomicU64,
}

impl MeterFactory {
    pub fn set_cutoff_ns(&self, cutoff_ns: u64) {
        self.cutoff_ns.store(cutoff_ns, Ordering::Relaxed);
    }

    pub fn cutoff_ns(&self) -> u64 {
        self.cutoff_ns.load(Ordering::Relaxed)
    }

    pub fn build(&self, old: Option<&MeterState>) -> MeterState {
        match old {
            Some(old) => MeterState::rotated_from(old, self.cutoff_ns()),
            None => MeterState::new(),
        }
    }
}
