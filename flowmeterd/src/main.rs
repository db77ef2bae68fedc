use anyhow::{Context, Result};
use clap::Parser;
use flowmeter_utils::unix_time::{Clock, SystemClock, NANOS_PER_SECOND};
use flowmeter_utils::{sleep_until_seconds, Notification};
use flowmeterd::asn::{self, AsnTable};
use flowmeterd::export::{build_sender, FlowSender};
use flowmeterd::meter::MeterFactory;
use flowmeterd::processor::TapProcessor;
use flowmeterd::reduce::combine_states;
use log::{info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::Path;
use std::sync::Arc;

// Use JemAllocator only on supported platforms
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use jemallocator::Jemalloc;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(about = "Passive flow metering agent: aggregates tapped packets \
into flow records and exports them as IPFIX or CSV")]
struct Args {
    /// Name of the packet-tap endpoint to meter.
    #[arg(long, default_value = "")]
    testimony: String,

    /// Socket address of the IPFIX collector ("IPv4:port" or
    /// "[IPv6]:port"), or the literal "stdout" for CSV snapshots.
    #[arg(long, default_value = "127.0.0.1:6555")]
    collector: String,

    /// Upload flows to the collector once every X seconds.
    #[arg(long, default_value_t = 60.0)]
    upload_every_secs: f64,

    /// Time out idle flows after X seconds.
    #[arg(long, default_value_t = 300.0)]
    flow_timeout_secs: f64,

    /// CSV of "start IPv6, end IPv6, ASN" ranges. Empty disables ASN
    /// enrichment.
    #[arg(long, default_value = "")]
    asns_csv: String,

    /// Re-read the ASN CSV once every X seconds.
    #[arg(long, default_value_t = 86400.0)]
    asns_reread_every_secs: f64,
}

fn main() -> Result<()> {
    // Configure log level with RUST_LOG environment variable,
    // defaulting to "info"
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let args = Args::parse();

    let mut asns = AsnTable::new();
    if !args.asns_csv.is_empty() {
        asn::load_from_csv(&mut asns, Path::new(&args.asns_csv))
            .with_context(|| format!("Loading ASN CSV {} failed", args.asns_csv))?;
    }

    let mut sender = build_sender(&args.collector)?;

    let factory = Arc::new(MeterFactory::default());
    let mut processor = TapProcessor::new(&args.testimony, factory.clone());
    processor
        .start_threads()
        .with_context(|| format!("Starting workers on tap '{}' failed", args.testimony))?;

    // SIGINT/SIGTERM request a final gather instead of killing us mid-swap.
    let stop = Arc::new(Notification::new());
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signal_stop = stop.clone();
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            warn!("Shutting down on signal {sig}");
            signal_stop.notify();
        }
    });

    let clock = SystemClock;
    let mut last_upload_secs = clock.now_seconds()?;
    let mut last_asns_read_secs = last_upload_secs;
    while sleep_until_seconds(last_upload_secs + args.upload_every_secs, &stop) {
        last_upload_secs = clock.now_seconds()?;
        export_cycle(
            &mut processor,
            &factory,
            &asns,
            sender.as_mut(),
            last_upload_secs,
            args.flow_timeout_secs,
            false,
        );
        if !args.asns_csv.is_empty()
            && last_upload_secs - last_asns_read_secs >= args.asns_reread_every_secs
        {
            info!("Reloading ASN ranges from {}", args.asns_csv);
            asns.clear();
            asn::load_from_csv(&mut asns, Path::new(&args.asns_csv))
                .with_context(|| format!("Reloading ASN CSV {} failed", args.asns_csv))?;
            last_asns_read_secs = last_upload_secs;
        }
    }

    // Final gather: join the workers and flush whatever they still held.
    export_cycle(
        &mut processor,
        &factory,
        &asns,
        sender.as_mut(),
        clock.now_seconds()?,
        args.flow_timeout_secs,
        true,
    );
    Ok(())
}

/// One export tick: set the idle cutoff, gather and reduce the worker
/// states, enrich with ASNs, and hand the merged table to the exporter.
fn export_cycle(
    processor: &mut TapProcessor,
    factory: &MeterFactory,
    asns: &AsnTable,
    sender: &mut dyn FlowSender,
    now_secs: f64,
    flow_timeout_secs: f64,
    last: bool,
) {
    let cutoff_ns = ((now_secs - flow_timeout_secs) * NANOS_PER_SECOND as f64) as u64;
    factory.set_cutoff_ns(cutoff_ns);
    let states = processor.gather(last);
    let mut merged = combine_states(states);
    if !asns.is_empty() {
        for (key, stats) in merged.flows_mut() {
            stats.src_asn = asns.lookup(&key.src_ip);
            stats.dst_asn = asns.lookup(&key.dst_ip);
        }
    }
    sender.send(merged.flows(), cutoff_ns);
}
