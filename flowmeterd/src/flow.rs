//! Flow keys, per-flow counters, and the flow table they live in.

use byteorder::{BigEndian, ByteOrder};
use fxhash::FxHashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::AddAssign;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_RST: u8 = 0x04;

/// IANA flowEndReason codes
/// (http://www.iana.org/assignments/ipfix/ipfix.xhtml).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndReason {
    /// The flow was terminated because it was considered to be idle.
    IdleTimeout = 1,
    /// The flow was terminated for reporting purposes while it was still
    /// active, for example after the maximum lifetime of unreported
    /// flows was reached.
    ActiveTimeout = 2,
    /// The metering process detected signals indicating the end of the
    /// flow, for example the TCP FIN flag.
    EndDetected = 3,
    /// The flow was terminated because of some external event, for
    /// example a shutdown of the metering process.
    ForcedEnd = 4,
    /// The flow was terminated because of lack of resources in the
    /// metering or exporting process.
    LackOfResources = 5,
}

/// Identity of one metered flow. IPv4 addresses occupy the low four
/// bytes of the 16-byte fields with the upper twelve zero.
///
/// Equality and hashing are derived over the logical fields, so there is
/// no dependence on in-memory layout or padding. The v6-to-v4 zeroing in
/// `set_network` keeps a key identity-stable no matter which order its
/// setters ran in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub vlan: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// 0 = unknown, 4 = IPv4, 6 = IPv6.
    pub network: u8,
    pub protocol: u8,
    /// 6-bit DSCP / traffic class, right-aligned.
    pub tos: u8,
}

impl FlowKey {
    pub fn set_network(&mut self, net: u8) {
        if self.network == 6 && net == 4 {
            // Switching from v6 to v4 must clear the IP bytes, since v4
            // only rewrites the low four.
            self.src_ip = [0; 16];
            self.dst_ip = [0; 16];
        }
        self.network = net;
    }

    pub fn set_src_ip4(&mut self, ip4: u32) {
        self.set_network(4);
        BigEndian::write_u32(&mut self.src_ip[12..16], ip4);
    }

    pub fn set_dst_ip4(&mut self, ip4: u32) {
        self.set_network(4);
        BigEndian::write_u32(&mut self.dst_ip[12..16], ip4);
    }

    pub fn src_ip4(&self) -> u32 {
        debug_assert_eq!(self.network, 4);
        BigEndian::read_u32(&self.src_ip[12..16])
    }

    pub fn dst_ip4(&self) -> u32 {
        debug_assert_eq!(self.network, 4);
        BigEndian::read_u32(&self.dst_ip[12..16])
    }

    pub fn set_src_ip6(&mut self, ip6: &[u8; 16]) {
        self.set_network(6);
        self.src_ip = *ip6;
    }

    pub fn set_dst_ip6(&mut self, ip6: &[u8; 16]) {
        self.set_network(6);
        self.dst_ip = *ip6;
    }

    /// Source address as a Rust `IpAddr`, for rendering.
    pub fn src_addr(&self) -> IpAddr {
        Self::render(&self.src_ip, self.network)
    }

    /// Destination address as a Rust `IpAddr`, for rendering.
    pub fn dst_addr(&self) -> IpAddr {
        Self::render(&self.dst_ip, self.network)
    }

    fn render(ip: &[u8; 16], network: u8) -> IpAddr {
        if network == 4 {
            IpAddr::V4(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]))
        } else {
            IpAddr::V6(Ipv6Addr::from(*ip))
        }
    }
}

/// Counters aggregated for one flow key. The ASNs stay zero until the
/// export path fills them in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub bytes: u64,
    pub packets: u64,
    /// OR of all TCP flag bytes seen.
    pub tcp_flags: u8,
    /// Nanoseconds since epoch; 0 means "no data yet".
    pub first_ns: u64,
    pub last_ns: u64,
    pub src_asn: u32,
    pub dst_asn: u32,
}

impl FlowStats {
    pub fn for_packet(bytes: u64, packets: u64, ts_ns: u64) -> Self {
        Self {
            bytes,
            packets,
            first_ns: ts_ns,
            last_ns: ts_ns,
            ..Default::default()
        }
    }

    /// Why this flow's record is being emitted, evaluated at `cutoff_ns`.
    pub fn end_reason(&self, cutoff_ns: u64) -> EndReason {
        if self.last_ns < cutoff_ns {
            return EndReason::IdleTimeout;
        }
        if self.tcp_flags & (TCP_FIN | TCP_RST) != 0 {
            return EndReason::EndDetected;
        }
        EndReason::ActiveTimeout
    }
}

impl AddAssign<&FlowStats> for FlowStats {
    fn add_assign(&mut self, other: &FlowStats) {
        self.bytes += other.bytes;
        self.packets += other.packets;
        self.tcp_flags |= other.tcp_flags;
        if other.first_ns != 0
            && (self.first_ns == 0 || other.first_ns < self.first_ns)
        {
            self.first_ns = other.first_ns;
        }
        if other.last_ns != 0
            && (self.last_ns == 0 || other.last_ns > self.last_ns)
        {
            self.last_ns = other.last_ns;
        }
    }
}

pub type FlowTable = FxHashMap<FlowKey, FlowStats>;

/// Insert `stats` for `key`, merging with any entry already present.
pub fn add_to_table(table: &mut FlowTable, key: FlowKey, stats: FlowStats) {
    table
        .entry(key)
        .and_modify(|existing| *existing += &stats)
        .or_insert(stats);
}

/// Merge every entry of `src` into `dst`.
pub fn combine_tables(dst: &mut FlowTable, src: FlowTable) {
    for (key, stats) in src {
        add_to_table(dst, key, stats);
    }
}
