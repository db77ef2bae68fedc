//! IPFIX (netflow v10) packet building and UDP export.
//!
//! Every datagram is a 16-byte message header followed by exactly one
//! set. A template set describes the 16 fields of the per-family data
//! records; data sets carry fixed-width big-endian records until the
//! 1400-byte MTU budget runs out.

use super::FlowSender;
use crate::flow::{EndReason, FlowKey, FlowStats, FlowTable};
use anyhow::Context;
use flowmeter_utils::unix_time::{Clock, SystemClock, NANOS_PER_SECOND};
use log::{error, info};
use std::net::{SocketAddr, UdpSocket};

/// MTU-safe UDP payload budget.
pub const MAX_PACKET_SIZE: usize = 1400;

const MESSAGE_HEADER_SIZE: usize = 16;
const SET_HEADER_SIZE: usize = 4;

/// Every exporter reports the same observation domain.
const OBSERVATION_DOMAIN: u32 = 12345;

// IANA information element identifiers
// (http://www.iana.org/assignments/ipfix/ipfix.xhtml).
const IN_BYTES: u16 = 1;
const IN_PKTS: u16 = 2;
const PROTOCOL: u16 = 4;
const IP_CLASS_OF_SERVICE: u16 = 5;
const TCP_FLAGS: u16 = 6;
const L4_SRC_PORT: u16 = 7;
const IPV4_SRC_ADDR: u16 = 8;
const L4_DST_PORT: u16 = 11;
const IPV4_DST_ADDR: u16 = 12;
const BGP_SOURCE_AS_NUMBER: u16 = 16;
const BGP_DESTINATION_AS_NUMBER: u16 = 17;
const IPV6_SRC_ADDR: u16 = 27;
const IPV6_DST_ADDR: u16 = 28;
const ICMP_TYPE: u16 = 32;
const VLAN_ID: u16 = 58;
const FLOW_END_REASON: u16 = 136;
const FLOW_START_NANOSECONDS: u16 = 156;
const FLOW_END_NANOSECONDS: u16 = 157;

const FIELD_COUNT: usize = 16;

/// Field layout shared by both data templates; only the address width
/// differs between families.
const FIELDS_V4: [(u16, u16); FIELD_COUNT] = [
    (IPV4_SRC_ADDR, 4),
    (IPV4_DST_ADDR, 4),
    (L4_SRC_PORT, 2),
    (L4_DST_PORT, 2),
    (PROTOCOL, 1),
    (TCP_FLAGS, 1),
    (ICMP_TYPE, 2),
    (BGP_SOURCE_AS_NUMBER, 4),
    (BGP_DESTINATION_AS_NUMBER, 4),
    (IN_BYTES, 8),
    (IN_PKTS, 8),
    (FLOW_START_NANOSECONDS, 8),
    (FLOW_END_NANOSECONDS, 8),
    (IP_CLASS_OF_SERVICE, 1),
    (FLOW_END_REASON, 1),
    (VLAN_ID, 2),
];

const FIELDS_V6: [(u16, u16); FIELD_COUNT] = [
    (IPV6_SRC_ADDR, 16),
    (IPV6_DST_ADDR, 16),
    (L4_SRC_PORT, 2),
    (L4_DST_PORT, 2),
    (PROTOCOL, 1),
    (TCP_FLAGS, 1),
    (ICMP_TYPE, 2),
    (BGP_SOURCE_AS_NUMBER, 4),
    (BGP_DESTINATION_AS_NUMBER, 4),
    (IN_BYTES, 8),
    (IN_PKTS, 8),
    (FLOW_START_NANOSECONDS, 8),
    (FLOW_END_NANOSECONDS, 8),
    (IP_CLASS_OF_SERVICE, 1),
    (FLOW_END_REASON, 1),
    (VLAN_ID, 2),
];

const fn record_size(fields: &[(u16, u16)]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < fields.len() {
        total += fields[i].1 as usize;
        i += 1;
    }
    total
}

const RECORD_SIZE_V4: usize = record_size(&FIELDS_V4);
const RECORD_SIZE_V6: usize = record_size(&FIELDS_V6);

/// Which kind of set the packet under construction carries. The values
/// double as the on-wire set IDs: templates live in set 2, data records
/// in the set named by their template ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Template = 2,
    V4 = 256,
    V6 = 257,
}

/// Builder for one IPFIX datagram in a fixed buffer.
pub struct IpfixPacket {
    buffer: [u8; MAX_PACKET_SIZE],
    len: usize,
    count: u16,
    packet_type: PacketType,
    unix_secs: u32,
}

impl IpfixPacket {
    pub fn new(unix_secs: u32) -> Self {
        Self {
            buffer: [0; MAX_PACKET_SIZE],
            len: 0,
            count: 0,
            packet_type: PacketType::Template,
            unix_secs,
        }
    }

    /// Start over with a fresh message header and an (unpatched) set
    /// header for a set of the given type.
    pub fn reset(&mut self, packet_type: PacketType, sequence: u32) {
        self.buffer = [0; MAX_PACKET_SIZE];
        self.len = 0;
        self.count = 0;
        self.packet_type = packet_type;
        self.put_u16(10); // version
        self.put_u16(0xFFFF); // message length, patched in packet_data
        self.put_u32(self.unix_secs);
        self.put_u32(sequence);
        self.put_u32(OBSERVATION_DOMAIN);
        self.put_u16(packet_type as u16); // set ID
        self.put_u16(0xFFFF); // set length, patched in packet_data
    }

    /// Records (template or data) in the current set.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Write the 16-field template record for one address family. Only
    /// valid on a `Template` packet.
    pub fn write_template(&mut self, v4: bool) {
        assert_eq!(
            self.packet_type,
            PacketType::Template,
            "template written into a data packet"
        );
        self.count += 1;
        let (template_id, fields) = if v4 {
            (PacketType::V4, &FIELDS_V4)
        } else {
            (PacketType::V6, &FIELDS_V6)
        };
        self.put_u16(template_id as u16);
        self.put_u16(FIELD_COUNT as u16);
        for (field_id, field_len) in fields {
            self.put_u16(*field_id);
            self.put_u16(*field_len);
        }
    }

    /// Append one data record. Returns `true` when the buffer cannot fit
    /// another record, i.e. the caller must send and reset.
    pub fn add_record(
        &mut self,
        key: &FlowKey,
        stats: &FlowStats,
        end_reason: EndReason,
    ) -> bool {
        self.count += 1;
        let record_size = match self.packet_type {
            PacketType::V4 => {
                debug_assert_eq!(key.network, 4);
                self.put_u32(key.src_ip4());
                self.put_u32(key.dst_ip4());
                RECORD_SIZE_V4
            }
            PacketType::V6 => {
                debug_assert_eq!(key.network, 6);
                self.put_bytes(&key.src_ip);
                self.put_bytes(&key.dst_ip);
                RECORD_SIZE_V6
            }
            PacketType::Template => {
                panic!("data record added to a template packet")
            }
        };
        self.put_u16(key.src_port);
        self.put_u16(key.dst_port);
        self.put_u8(key.protocol);
        self.put_u8(stats.tcp_flags);
        // The 2-byte ICMP_TYPE field packs type then code.
        self.put_u8(key.icmp_type);
        self.put_u8(key.icmp_code);
        self.put_u32(stats.src_asn);
        self.put_u32(stats.dst_asn);
        self.put_u64(stats.bytes);
        self.put_u64(stats.packets);
        self.put_u64(stats.first_ns);
        self.put_u64(stats.last_ns);
        self.put_u8(key.tos);
        self.put_u8(end_reason as u8);
        self.put_u16(key.vlan);

        self.len + record_size > MAX_PACKET_SIZE
    }

    /// Patch the message and set lengths and return the wire bytes.
    pub fn packet_data(&mut self) -> &[u8] {
        let message_len = self.len as u16;
        self.buffer[2..4].copy_from_slice(&message_len.to_be_bytes());
        let set_len = (self.len - MESSAGE_HEADER_SIZE) as u16;
        self.buffer[MESSAGE_HEADER_SIZE + 2..MESSAGE_HEADER_SIZE + 4]
            .copy_from_slice(&set_len.to_be_bytes());
        &self.buffer[..self.len]
    }

    fn put_u8(&mut self, v: u8) {
        self.buffer[self.len] = v;
        self.len += 1;
    }

    fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buffer[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }
}

/// Sends flow tables to an IPFIX collector over UDP. The sequence number
/// counts data records and runs monotonically across ticks.
pub struct PacketSender {
    socket: UdpSocket,
    sequence: u32,
    clock: Box<dyn Clock>,
}

impl PacketSender {
    pub fn connect(collector: SocketAddr) -> anyhow::Result<Self> {
        Self::connect_with_clock(collector, Box::new(SystemClock))
    }

    pub fn connect_with_clock(
        collector: SocketAddr,
        clock: Box<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let bind_addr = if collector.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        socket
            .connect(collector)
            .with_context(|| format!("Connect to {collector} failed"))?;
        Ok(Self { socket, sequence: 0, clock })
    }

    fn transmit(socket: &UdpSocket, pkt: &mut IpfixPacket) {
        if let Err(e) = socket.send(pkt.packet_data()) {
            error!("Sending IPFIX packet to collector failed: {e}");
        }
    }
}

impl FlowSender for PacketSender {
    fn send(&mut self, flows: &FlowTable, cutoff_ns: u64) {
        let unix_secs = match self.clock.now_nanos() {
            Ok(ns) => (ns / NANOS_PER_SECOND) as u32,
            Err(e) => {
                error!("Clock unavailable, skipping IPFIX export: {e}");
                return;
            }
        };
        info!("Flushing {} flows to the collector", flows.len());
        let mut pkt = IpfixPacket::new(unix_secs);

        for family in [4u8, 6u8] {
            // Each family gets its own template datagram, then data
            // datagrams as the buffer fills.
            pkt.reset(PacketType::Template, self.sequence);
            pkt.write_template(family == 4);
            Self::transmit(&self.socket, &mut pkt);

            let data_type = if family == 4 { PacketType::V4 } else { PacketType::V6 };
            pkt.reset(data_type, self.sequence);
            let mut written = 0usize;
            for (key, stats) in flows {
                if key.network != family {
                    continue;
                }
                let end_reason = stats.end_reason(cutoff_ns);
                if stats.packets == 0 && end_reason == EndReason::ActiveTimeout {
                    // Pure carry-over with no new traffic this cycle.
                    continue;
                }
                written += 1;
                self.sequence = self.sequence.wrapping_add(1);
                if pkt.add_record(key, stats, end_reason) {
                    Self::transmit(&self.socket, &mut pkt);
                    pkt.reset(data_type, self.sequence);
                }
            }
            if pkt.count() > 0 {
                Self::transmit(&self.socket, &mut pkt);
            }
            info!("Wrote {written} IPv{family} flow records");
        }
    }
}
