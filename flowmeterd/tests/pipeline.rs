//! End-to-end pipeline tests: packets injected into a loopback tap flow
//! through the worker pool, the gather/rotate protocol, the parallel
//! reducer, and out through the exporters.

use byteorder::{BigEndian, ByteOrder};
use flowmeter_tap::{loopback, PacketBuf};
use flowmeterd::export::{FlowSender, SnapshotSender};
use flowmeterd::flow::{EndReason, FlowTable, TCP_FIN};
use flowmeterd::meter::{MeterFactory, MeterState};
use flowmeterd::processor::TapProcessor;
use flowmeterd::reduce::combine_states;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SECOND_NS: u64 = 1_000_000_000;

fn ethernet(ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 14];
    BigEndian::write_u16(&mut pkt[12..14], ethertype);
    pkt.extend_from_slice(payload);
    pkt
}

fn ipv4(protocol: u8, src: u32, dst: u32, payload: &[u8]) -> Vec<u8> {
    let mut hdr = vec![0u8; 20];
    hdr[0] = 0x45;
    hdr[9] = protocol;
    BigEndian::write_u32(&mut hdr[12..16], src);
    BigEndian::write_u32(&mut hdr[16..20], dst);
    hdr.extend_from_slice(payload);
    hdr
}

fn ipv6(next_header: u8, src: [u8; 16], dst: [u8; 16], payload: &[u8]) -> Vec<u8> {
    let mut hdr = vec![0u8; 40];
    BigEndian::write_u32(&mut hdr[0..4], 0x6000_0000);
    hdr[6] = next_header;
    hdr[8..24].copy_from_slice(&src);
    hdr[24..40].copy_from_slice(&dst);
    hdr.extend_from_slice(payload);
    hdr
}

fn tcp(sport: u16, dport: u16, flags: u8) -> Vec<u8> {
    let mut hdr = vec![0u8; 20];
    BigEndian::write_u16(&mut hdr[0..2], sport);
    BigEndian::write_u16(&mut hdr[2..4], dport);
    hdr[13] = flags;
    hdr
}

fn udp(sport: u16, dport: u16) -> Vec<u8> {
    let mut hdr = vec![0u8; 8];
    BigEndian::write_u16(&mut hdr[0..2], sport);
    BigEndian::write_u16(&mut hdr[2..4], dport);
    hdr
}

/// Ethernet/IPv4 TCP `10.0.0.1:1234 -> 10.0.0.2:80`, padded to 60 bytes.
fn syn_packet(flags: u8) -> Vec<u8> {
    let mut pkt = ethernet(
        0x0800,
        &ipv4(6, 0x0a000001, 0x0a000002, &tcp(1234, 80, flags)),
    );
    pkt.resize(60, 0);
    pkt
}

/// Gather-and-merge until `pred` holds on the accumulated table or the
/// deadline passes. Workers drain the tap asynchronously, so the first
/// gather can race the injection.
fn gather_until(
    processor: &mut TapProcessor,
    pred: impl Fn(&MeterState) -> bool,
    deadline: Duration,
) -> MeterState {
    let start = Instant::now();
    let mut merged = MeterState::new();
    loop {
        merged = {
            let mut states = processor.gather(false);
            states.push(merged);
            combine_states(states)
        };
        if pred(&merged) || start.elapsed() > deadline {
            return merged;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn snapshot_rows(flows: &FlowTable, cutoff_ns: u64) -> Vec<String> {
    let mut sender = SnapshotSender::new(Vec::new());
    sender.send(flows, cutoff_ns);
    String::from_utf8(sender.into_inner())
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

#[test]
fn single_tcp_flow_single_tick() {
    let injector = loopback::create("e2e_single", 1);
    let factory = Arc::new(MeterFactory::default());
    let mut processor = TapProcessor::new("mem:e2e_single", factory.clone());
    processor.start_threads().unwrap();

    injector.inject(0, vec![PacketBuf::from_bytes(syn_packet(0x02), SECOND_NS)]);

    let merged = gather_until(&mut processor, |s| s.len() == 1, Duration::from_secs(5));
    assert_eq!(merged.len(), 1);
    let (key, stats) = merged.flows().iter().next().unwrap();
    assert_eq!(key.network, 4);
    assert_eq!(key.src_ip4(), 0x0a000001);
    assert_eq!(key.dst_ip4(), 0x0a000002);
    assert_eq!(key.src_port, 1234);
    assert_eq!(key.dst_port, 80);
    assert_eq!(key.protocol, 6);
    assert_eq!(stats.tcp_flags, 0x02);
    assert_eq!(stats.bytes, 60);
    assert_eq!(stats.packets, 1);
    assert_eq!(stats.first_ns, SECOND_NS);
    assert_eq!(stats.last_ns, SECOND_NS);
    // Still active at a cutoff in the past.
    assert_eq!(stats.end_reason(0), EndReason::ActiveTimeout);

    processor.gather(true);
}

#[test]
fn fin_ends_the_flow_and_is_not_carried() {
    let injector = loopback::create("e2e_fin", 1);
    let factory = Arc::new(MeterFactory::default());
    let mut processor = TapProcessor::new("mem:e2e_fin", factory.clone());
    processor.start_threads().unwrap();

    injector.inject(
        0,
        vec![
            PacketBuf::from_bytes(syn_packet(0x12), SECOND_NS),
            PacketBuf::from_bytes(syn_packet(TCP_FIN), 2 * SECOND_NS),
        ],
    );

    let merged = gather_until(
        &mut processor,
        |s| s.flows().values().any(|f| f.packets == 2),
        Duration::from_secs(5),
    );
    let stats = merged.flows().values().next().unwrap();
    assert_eq!(stats.tcp_flags, 0x13);
    assert_eq!(stats.end_reason(0), EndReason::EndDetected);

    // The rotation at gather time saw the FIN, so nothing was carried
    // into the workers' replacement states.
    let remainder = processor.gather(true);
    assert!(remainder.iter().all(|s| s.is_empty()));
}

#[test]
fn idle_flow_times_out_and_is_dropped() {
    let injector = loopback::create("e2e_idle", 1);
    let factory = Arc::new(MeterFactory::default());
    let mut processor = TapProcessor::new("mem:e2e_idle", factory.clone());
    processor.start_threads().unwrap();

    // One UDP packet at t=0; the next tick runs at t=400s with a 300s
    // flow timeout, so the cutoff is t=100s.
    let pkt = ethernet(0x0800, &ipv4(17, 0x0a000001, 0x0a000002, &udp(5000, 53)));
    injector.inject(0, vec![PacketBuf::from_bytes(pkt, 0)]);

    let cutoff_ns = 100 * SECOND_NS;
    factory.set_cutoff_ns(cutoff_ns);
    let merged = gather_until(&mut processor, |s| s.len() == 1, Duration::from_secs(5));
    let stats = merged.flows().values().next().unwrap();
    assert_eq!(stats.end_reason(cutoff_ns), EndReason::IdleTimeout);

    // And the CSV snapshot reports end reason 1 for it.
    let rows = snapshot_rows(merged.flows(), cutoff_ns);
    assert_eq!(rows.len(), 1);
    assert!(rows[0].ends_with(",1"));

    // Idle flows are not carried into the next cycle.
    let remainder = processor.gather(true);
    assert!(remainder.iter().all(|s| s.is_empty()));
}

#[test]
fn vlan_metadata_reaches_the_key() {
    let injector = loopback::create("e2e_vlan", 1);
    let factory = Arc::new(MeterFactory::default());
    let mut processor = TapProcessor::new("mem:e2e_vlan", factory);
    processor.start_threads().unwrap();

    // A VLAN-tagged IPv6/UDP frame. The key's VLAN comes from the tap's
    // metadata, not from the parsed tag.
    let src = [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    let dst = [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
    let mut tagged = vec![0u8; 4];
    BigEndian::write_u16(&mut tagged[0..2], 42);
    BigEndian::write_u16(&mut tagged[2..4], 0x86DD);
    tagged.extend_from_slice(&ipv6(17, src, dst, &udp(4000, 4001)));
    let frame = ethernet(0x8100, &tagged);

    injector.inject(
        0,
        vec![PacketBuf::from_bytes(frame, SECOND_NS).with_vlan(42)],
    );

    let merged = gather_until(&mut processor, |s| s.len() == 1, Duration::from_secs(5));
    let key = merged.flows().keys().next().unwrap();
    assert_eq!(key.vlan, 42);
    assert_eq!(key.network, 6);
    assert_eq!(&key.src_ip, &src);
    assert_eq!(&key.dst_ip, &dst);
    assert_eq!(key.src_port, 4000);
    assert_eq!(key.dst_port, 4001);

    processor.gather(true);
}

#[test]
fn parallel_merge_is_stable() {
    let injector = loopback::create("e2e_merge", 2);
    let factory = Arc::new(MeterFactory::default());
    let mut processor = TapProcessor::new("mem:e2e_merge", factory);
    processor.start_threads().unwrap();

    // The same flow hits both fanout slices with different timestamps.
    injector.inject(0, vec![PacketBuf::from_bytes(syn_packet(0x02), SECOND_NS)]);
    injector.inject(
        1,
        vec![PacketBuf::from_bytes(syn_packet(0x10), 3 * SECOND_NS)],
    );

    let merged = gather_until(
        &mut processor,
        |s| s.flows().values().any(|f| f.packets == 2),
        Duration::from_secs(5),
    );
    assert_eq!(merged.len(), 1);
    let stats = merged.flows().values().next().unwrap();
    assert_eq!(stats.bytes, 120);
    assert_eq!(stats.packets, 2);
    assert_eq!(stats.first_ns, SECOND_NS);
    assert_eq!(stats.last_ns, 3 * SECOND_NS);
    assert_eq!(stats.tcp_flags, 0x12);

    processor.gather(true);
}

#[test]
fn active_flows_carry_and_report_only_new_traffic() {
    let injector = loopback::create("e2e_carry", 1);
    let factory = Arc::new(MeterFactory::default());
    let mut processor = TapProcessor::new("mem:e2e_carry", factory.clone());
    processor.start_threads().unwrap();

    injector.inject(0, vec![PacketBuf::from_bytes(syn_packet(0x10), SECOND_NS)]);
    let first = gather_until(&mut processor, |s| s.len() == 1, Duration::from_secs(5));
    assert_eq!(first.flows().values().next().unwrap().packets, 1);

    // More traffic for the carried flow in the next cycle.
    injector.inject(
        0,
        vec![PacketBuf::from_bytes(syn_packet(0x10), 5 * SECOND_NS)],
    );
    let second = gather_until(
        &mut processor,
        |s| s.flows().values().any(|f| f.packets > 0),
        Duration::from_secs(5),
    );
    let stats = second.flows().values().next().unwrap();
    // Only the new packet is counted, but first_ns spans both cycles.
    assert_eq!(stats.packets, 1);
    assert_eq!(stats.bytes, 60);
    assert_eq!(stats.first_ns, SECOND_NS);
    assert_eq!(stats.last_ns, 5 * SECOND_NS);

    processor.gather(true);
}
