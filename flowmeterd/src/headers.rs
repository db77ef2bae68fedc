//! Layered packet-header decoder.
//!
//! Peels Ethernet, VLAN / Q-in-Q tags, and MPLS label stacks, then an
//! IPv4 or IPv6 header (with extension headers), then the transport
//! header. The decoder records borrowed views into the packet buffer and
//! never copies header bytes. When the buffer runs out mid-parse it
//! stops, leaving whatever was already recognized in place.

use byteorder::{BigEndian, ByteOrder};

pub const IPPROTO_HOPOPTS: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ROUTING: u8 = 43;
pub const IPPROTO_FRAGMENT: u8 = 44;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_DSTOPTS: u8 = 60;
pub const IPPROTO_MH: u8 = 135;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_8021Q: u16 = 0x8100;
const ETHERTYPE_8021AD: u16 = 0x88A8;
const ETHERTYPE_QINQ1: u16 = 0x9100;
const ETHERTYPE_QINQ2: u16 = 0x9200;
const ETHERTYPE_QINQ3: u16 = 0x9300;
const ETHERTYPE_MPLS_UC: u16 = 0x8847;
const ETHERTYPE_MPLS_MC: u16 = 0x8848;

// Not a real EtherType; marks "expect an ethernet header next".
const PSEUDO_ETHERNET: u16 = 0;

const MPLS_BOTTOM_OF_STACK: u32 = 1 << 8;

const ETHERNET_SIZE: usize = 14;
const IPV4_MIN_SIZE: usize = 20;
const IPV6_SIZE: usize = 40;
const TCP_SIZE: usize = 20;
const UDP_SIZE: usize = 8;
const ICMP_SIZE: usize = 8;
const IPV6_FRAGMENT_SIZE: usize = 8;

pub struct EthernetHeader<'p>(&'p [u8]);

impl EthernetHeader<'_> {
    pub fn ethertype(&self) -> u16 {
        BigEndian::read_u16(&self.0[12..14])
    }
}

pub struct Ipv4Header<'p>(&'p [u8]);

impl Ipv4Header<'_> {
    /// Header length in bytes (IHL * 4).
    pub fn header_len(&self) -> usize {
        ((self.0[0] & 0x0F) as usize) * 4
    }

    pub fn tos(&self) -> u8 {
        self.0[1]
    }

    pub fn protocol(&self) -> u8 {
        self.0[9]
    }

    pub fn saddr(&self) -> u32 {
        BigEndian::read_u32(&self.0[12..16])
    }

    pub fn daddr(&self) -> u32 {
        BigEndian::read_u32(&self.0[16..20])
    }
}

pub struct Ipv6Header<'p>(&'p [u8]);

impl Ipv6Header<'_> {
    /// The first 32-bit word: version, traffic class, flow label.
    pub fn flow_word(&self) -> u32 {
        BigEndian::read_u32(&self.0[0..4])
    }

    pub fn next_header(&self) -> u8 {
        self.0[6]
    }

    pub fn saddr(&self) -> &[u8; 16] {
        self.0[8..24].try_into().expect("fixed-width slice")
    }

    pub fn daddr(&self) -> &[u8; 16] {
        self.0[24..40].try_into().expect("fixed-width slice")
    }
}

pub struct TcpHeader<'p>(&'p [u8]);

impl TcpHeader<'_> {
    pub fn source(&self) -> u16 {
        BigEndian::read_u16(&self.0[0..2])
    }

    pub fn dest(&self) -> u16 {
        BigEndian::read_u16(&self.0[2..4])
    }

    pub fn flags(&self) -> u8 {
        self.0[13]
    }
}

pub struct UdpHeader<'p>(&'p [u8]);

impl UdpHeader<'_> {
    pub fn source(&self) -> u16 {
        BigEndian::read_u16(&self.0[0..2])
    }

    pub fn dest(&self) -> u16 {
        BigEndian::read_u16(&self.0[2..4])
    }
}

pub struct IcmpHeader<'p>(&'p [u8]);

impl IcmpHeader<'_> {
    pub fn icmp_type(&self) -> u8 {
        self.0[0]
    }

    pub fn icmp_code(&self) -> u8 {
        self.0[1]
    }
}

pub struct Icmp6Header<'p>(&'p [u8]);

impl Icmp6Header<'_> {
    pub fn icmp_type(&self) -> u8 {
        self.0[0]
    }

    pub fn icmp_code(&self) -> u8 {
        self.0[1]
    }
}

pub struct Ipv6FragmentHeader<'p>(&'p [u8]);

impl Ipv6FragmentHeader<'_> {
    /// Fragment offset bits (the high 13 bits of offset+flags). Nonzero
    /// means this is not the first fragment.
    pub fn fragment_offset(&self) -> u16 {
        BigEndian::read_u16(&self.0[2..4]) & 0xFFF8
    }
}

/// Views into one packet's headers. Every field starts `None` per parse;
/// a truncated or unrecognized packet keeps whatever layers were already
/// found.
#[derive(Default)]
pub struct Headers<'p> {
    pub eth: Option<EthernetHeader<'p>>,
    pub ip4: Option<Ipv4Header<'p>>,
    pub ip6: Option<Ipv6Header<'p>>,
    pub tcp: Option<TcpHeader<'p>>,
    pub udp: Option<UdpHeader<'p>>,
    pub icmp4: Option<IcmpHeader<'p>>,
    pub icmp6: Option<Icmp6Header<'p>>,
    pub ip6_frag: Option<Ipv6FragmentHeader<'p>>,
}

impl<'p> Headers<'p> {
    /// Parse `data`, which is expected to start with an ethernet header.
    pub fn parse(data: &'p [u8]) -> Self {
        let mut headers = Self::default();
        headers.parse_layers(data);
        headers
    }

    fn parse_layers(&mut self, data: &'p [u8]) {
        let mut offset = 0usize;
        let mut ethertype = PSEUDO_ETHERNET;

        // Strip all pre-IP encapsulation layers.
        let protocol = loop {
            match ethertype {
                PSEUDO_ETHERNET => {
                    let Some(bytes) = data.get(offset..offset + ETHERNET_SIZE) else {
                        return;
                    };
                    let eth = EthernetHeader(bytes);
                    ethertype = eth.ethertype();
                    self.eth = Some(eth);
                    offset += ETHERNET_SIZE;
                }
                ETHERTYPE_8021Q | ETHERTYPE_8021AD | ETHERTYPE_QINQ1
                | ETHERTYPE_QINQ2 | ETHERTYPE_QINQ3 => {
                    // Four bytes: the tag, then the inner EtherType.
                    let Some(bytes) = data.get(offset..offset + 4) else {
                        return;
                    };
                    ethertype = BigEndian::read_u16(&bytes[2..4]);
                    offset += 4;
                }
                ETHERTYPE_MPLS_UC | ETHERTYPE_MPLS_MC => {
                    loop {
                        // Five bytes: a label, plus the nibble after the
                        // stack that names the payload type.
                        let Some(bytes) = data.get(offset..offset + 5) else {
                            return;
                        };
                        let label = BigEndian::read_u32(&bytes[0..4]);
                        offset += 4;
                        if label & MPLS_BOTTOM_OF_STACK != 0 {
                            break;
                        }
                    }
                    match data[offset] >> 4 {
                        0 => {
                            // RFC 4385 pseudowire: skip the ethernet
                            // control word.
                            ethertype = PSEUDO_ETHERNET;
                            offset += 4;
                        }
                        4 => ethertype = ETHERTYPE_IPV4,
                        6 => ethertype = ETHERTYPE_IPV6,
                        _ => return,
                    }
                }
                ETHERTYPE_IPV4 => {
                    let Some(bytes) = data.get(offset..offset + IPV4_MIN_SIZE) else {
                        return;
                    };
                    let ip4 = Ipv4Header(bytes);
                    let header_len = ip4.header_len();
                    if header_len < IPV4_MIN_SIZE {
                        return;
                    }
                    let protocol = ip4.protocol();
                    self.ip4 = Some(ip4);
                    offset += header_len;
                    break protocol;
                }
                ETHERTYPE_IPV6 => {
                    let Some(bytes) = data.get(offset..offset + IPV6_SIZE) else {
                        return;
                    };
                    let ip6 = Ipv6Header(bytes);
                    let mut protocol = ip6.next_header();
                    self.ip6 = Some(ip6);
                    offset += IPV6_SIZE;

                    // Strip IPv6 extension headers.
                    loop {
                        match protocol {
                            IPPROTO_FRAGMENT => {
                                let Some(ext) =
                                    data.get(offset..offset + IPV6_FRAGMENT_SIZE)
                                else {
                                    return;
                                };
                                let frag = Ipv6FragmentHeader(ext);
                                let not_first = frag.fragment_offset() != 0;
                                self.ip6_frag = Some(frag);
                                if not_first {
                                    // Keep the IPs we have; the L4 header
                                    // lives in the first fragment.
                                    break;
                                }
                                protocol = ext[0];
                                offset += (ext[1] as usize + 1) * 8;
                            }
                            IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS
                            | IPPROTO_MH => {
                                let Some(ext) = data.get(offset..offset + 2) else {
                                    return;
                                };
                                protocol = ext[0];
                                offset += (ext[1] as usize + 1) * 8;
                            }
                            _ => break,
                        }
                    }
                    break protocol;
                }
                _ => return,
            }
        };

        match protocol {
            IPPROTO_TCP => self.tcp = data.get(offset..offset + TCP_SIZE).map(TcpHeader),
            IPPROTO_UDP => self.udp = data.get(offset..offset + UDP_SIZE).map(UdpHeader),
            IPPROTO_ICMP => {
                self.icmp4 = data.get(offset..offset + ICMP_SIZE).map(IcmpHeader)
            }
            IPPROTO_ICMPV6 => {
                self.icmp6 = data.get(offset..offset + ICMP_SIZE).map(Icmp6Header)
            }
            _ => {}
        }
    }
}
