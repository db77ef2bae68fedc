//! Mapping 128-bit addresses to Autonomous System Numbers through a set
//! of non-overlapping inclusive ranges, loaded from CSV.

use log::{debug, info};
use std::collections::BTreeMap;
use std::io::Read;
use std::net::Ipv6Addr;
use std::path::Path;
use thiserror::Error;

/// Addresses outside every range map to ASN 0.
pub const NO_ASN: u32 = 0;

#[derive(Error, Debug)]
pub enum AsnError {
    #[error("range start {from} is above range end {to}")]
    InvertedRange { from: Ipv6Addr, to: Ipv6Addr },
    #[error("ASN 0 is reserved for unmapped addresses")]
    ReservedAsn,
    #[error("range {from}-{to} overlaps an existing range")]
    Overlap { from: Ipv6Addr, to: Ipv6Addr },
    #[error("bad record on line {line}: {reason}")]
    BadRecord { line: u64, reason: String },
    #[error("reading ASN CSV failed: {0}")]
    Csv(#[from] csv::Error),
}

struct AsnRange {
    from: [u8; 16],
    asn: u32,
}

/// Inclusive address ranges keyed by their upper bound, so that a single
/// ordered probe lands on the only range that can contain an address.
#[derive(Default)]
pub struct AsnTable {
    ranges: BTreeMap<[u8; 16], AsnRange>,
}

impl AsnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the inclusive range `[from, to] -> asn`. The range must be
    /// well-ordered, carry a nonzero ASN, and stay disjoint from every
    /// range already present.
    pub fn add(
        &mut self,
        from: [u8; 16],
        to: [u8; 16],
        asn: u32,
    ) -> Result<(), AsnError> {
        if from > to {
            return Err(AsnError::InvertedRange {
                from: Ipv6Addr::from(from),
                to: Ipv6Addr::from(to),
            });
        }
        if asn == NO_ASN {
            return Err(AsnError::ReservedAsn);
        }
        // The successor by upper bound must start above our end; the
        // predecessor must end below our start.
        if let Some((_, next)) = self.ranges.range(to..).next() {
            if next.from <= to {
                return Err(AsnError::Overlap {
                    from: Ipv6Addr::from(from),
                    to: Ipv6Addr::from(to),
                });
            }
        }
        if let Some((prev_to, _)) = self.ranges.range(..to).next_back() {
            if *prev_to >= from {
                return Err(AsnError::Overlap {
                    from: Ipv6Addr::from(from),
                    to: Ipv6Addr::from(to),
                });
            }
        }
        debug!(
            "Mapping range {} - {} to ASN {}",
            Ipv6Addr::from(from),
            Ipv6Addr::from(to),
            asn
        );
        self.ranges.insert(to, AsnRange { from, asn });
        Ok(())
    }

    /// The ASN of the unique range containing `addr`, or [`NO_ASN`].
    pub fn lookup(&self, addr: &[u8; 16]) -> u32 {
        match self.ranges.range(*addr..).next() {
            Some((_, range)) if range.from <= *addr => range.asn,
            _ => NO_ASN,
        }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Load `start IPv6, end IPv6, ASN` lines into `table`. IPv4 ranges are
/// written as IPv4-mapped addresses (e.g. `::192.168.1.1`). Returns the
/// number of ranges read.
pub fn load_from_csv(table: &mut AsnTable, path: &Path) -> Result<usize, AsnError> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;
    load_ranges(table, reader)
}

/// As [`load_from_csv`], from any reader.
pub fn load_from_reader<R: Read>(
    table: &mut AsnTable,
    input: R,
) -> Result<usize, AsnError> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(input);
    load_ranges(table, reader)
}

fn load_ranges<R: Read>(
    table: &mut AsnTable,
    mut reader: csv::Reader<R>,
) -> Result<usize, AsnError> {
    let mut count = 0usize;
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        if record.len() != 3 {
            return Err(AsnError::BadRecord {
                line,
                reason: format!("expected 3 fields, found {}", record.len()),
            });
        }
        let from = parse_addr(&record[0], line)?;
        let to = parse_addr(&record[1], line)?;
        let asn: u32 = record[2].parse().map_err(|_| AsnError::BadRecord {
            line,
            reason: format!("bad ASN '{}'", &record[2]),
        })?;
        table.add(from, to, asn)?;
        count += 1;
    }
    info!("Read {count} ranges from ASN CSV");
    Ok(count)
}

fn parse_addr(field: &str, line: u64) -> Result<[u8; 16], AsnError> {
    field
        .parse::<Ipv6Addr>()
        .map(|ip| ip.octets())
        .map_err(|_| AsnError::BadRecord {
            line,
            reason: format!("bad IPv6 address '{field}'"),
        })
}
