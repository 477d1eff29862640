//! Time-partitioned snapshot storage.
//!
//! One CSV file per `(asset, slot)` under `<data_dir>/<asset>/`, named by
//! the slot label (`2025-07-18_08.csv`). Files are append-only and
//! human-inspectable; a partition is sealed the moment the writer opens a
//! successor slot. The column order is fixed and must not change — it is
//! the on-disk contract consumed by operators and the sync adapter.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::{AssetId, SlotLabel, SlotSpec, Snapshot, UtcInstant};

/// Stable partition column order.
pub const PARTITION_HEADER: &str =
    "timestamp,asset,exchange,price,bid,ask,spread,volume,spread_avg,spread_avg_pct";

const FIELD_COUNT: usize = 10;

/// Errors raised by partition storage.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("record cannot be encoded: {reason}")]
    Encode { reason: String },
}

/// Reference to one partition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRef {
    pub label: SlotLabel,
    pub path: PathBuf,
}

impl PartitionRef {
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.label)
    }
}

/// Per-asset partition directory: listing, loading, and path layout.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    asset: AssetId,
    spec: SlotSpec,
    root: PathBuf,
}

impl PartitionStore {
    pub fn open(data_dir: &Path, asset: AssetId, spec: SlotSpec) -> Result<Self, WriteError> {
        let root = data_dir.join(asset.dir_name());
        std::fs::create_dir_all(&root)?;
        Ok(Self { asset, spec, root })
    }

    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    pub fn spec(&self) -> SlotSpec {
        self.spec
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, label: SlotLabel) -> PathBuf {
        self.root.join(format!("{label}.csv"))
    }

    /// All partition files, sorted by slot start.
    pub fn list(&self) -> Result<Vec<PartitionRef>, WriteError> {
        let mut refs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("csv") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            match SlotLabel::parse(stem) {
                Ok(label) => refs.push(PartitionRef { label, path }),
                Err(_) => {
                    warn!(asset = %self.asset, file = %path.display(),
                          "ignoring file with non-slot name in partition directory");
                }
            }
        }
        refs.sort_by_key(|r| r.label);
        Ok(refs)
    }

    /// Load one partition in arrival order.
    ///
    /// Malformed lines (e.g. a torn trailing line after a crash) are
    /// skipped with a warning rather than poisoning the partition.
    pub fn load(&self, partition: &PartitionRef) -> Result<Vec<Snapshot>, WriteError> {
        let file = File::open(&partition.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if index == 0 {
                if line != PARTITION_HEADER {
                    warn!(asset = %self.asset, file = %partition.path.display(),
                          "partition header does not match the expected column order");
                }
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            match decode_record(&line) {
                Ok(snapshot) => records.push(snapshot),
                Err(reason) => {
                    warn!(asset = %self.asset, file = %partition.path.display(),
                          line = index + 1, %reason, "skipping undecodable partition line");
                }
            }
        }

        Ok(records)
    }

    /// Load every partition, concatenated in slot order (arrival order
    /// within each slot).
    pub fn load_all(&self) -> Result<Vec<Snapshot>, WriteError> {
        let mut records = Vec::new();
        for partition in self.list()? {
            records.extend(self.load(&partition)?);
        }
        Ok(records)
    }

    /// Load the partitions whose slot could contain records at or after
    /// `cutoff` — the working set for an incremental rebuild.
    pub fn load_covering(&self, cutoff: UtcInstant) -> Result<Vec<Snapshot>, WriteError> {
        let width = self.spec.width();
        let mut records = Vec::new();
        for partition in self.list()? {
            let slot_end = partition.label.start() + width;
            if slot_end > cutoff {
                records.extend(self.load(&partition)?);
            }
        }
        Ok(records)
    }

    /// Number of data records in one partition (header excluded).
    pub fn record_count(&self, partition: &PartitionRef) -> Result<u64, WriteError> {
        let file = File::open(&partition.path)?;
        let reader = BufReader::new(file);
        let mut count = 0u64;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if index == 0 || line.trim().is_empty() {
                continue;
            }
            count += 1;
        }
        Ok(count)
    }
}

/// Outcome of one append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Slot the record landed in.
    pub label: SlotLabel,
    /// A new active partition was opened.
    pub rotated: bool,
    /// The partition sealed by this append, if any.
    pub sealed: Option<SlotLabel>,
    /// The record arrived with a timestamp behind the newest one already
    /// written for its slot (clock skew, retried fetch).
    pub out_of_order: bool,
}

#[derive(Debug, Clone, Copy)]
struct ActiveSlot {
    label: SlotLabel,
    newest: UtcInstant,
}

/// Appends snapshots to the active partition, rotating on slot boundaries.
///
/// Appends must be serialized per asset by the caller (the pipeline holds
/// one writer per asset behind its mutex); the writer itself keeps only
/// the active-slot cursor and the out-of-order audit counter.
#[derive(Debug)]
pub struct PartitionWriter {
    store: PartitionStore,
    active: Option<ActiveSlot>,
    out_of_order_total: u64,
}

impl PartitionWriter {
    /// Open a writer, recovering the active-slot cursor from the newest
    /// partition on disk so restarts keep appending where they left off.
    pub fn open(store: PartitionStore) -> Result<Self, WriteError> {
        let active = match store.list()?.last() {
            Some(partition) => {
                let records = store.load(partition)?;
                records
                    .iter()
                    .map(|record| record.timestamp)
                    .max()
                    .map(|newest| ActiveSlot {
                        label: partition.label,
                        newest,
                    })
            }
            None => None,
        };

        Ok(Self {
            store,
            active,
            out_of_order_total: 0,
        })
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// Total out-of-order appends observed since this writer was opened.
    pub fn out_of_order_total(&self) -> u64 {
        self.out_of_order_total
    }

    /// Append one snapshot in arrival order.
    ///
    /// A snapshot for a later slot seals the active partition and opens a
    /// new one. A snapshot for an *earlier* slot (severe clock skew) is
    /// routed to that slot's file so the containment invariant holds, and
    /// is flagged out-of-order; it is never rejected.
    pub fn append(&mut self, snapshot: &Snapshot) -> Result<AppendOutcome, WriteError> {
        let label = self.store.spec().label(snapshot.timestamp);

        let outcome = match self.active {
            None => {
                self.write_record(label, snapshot)?;
                self.active = Some(ActiveSlot {
                    label,
                    newest: snapshot.timestamp,
                });
                AppendOutcome {
                    label,
                    rotated: true,
                    sealed: None,
                    out_of_order: false,
                }
            }
            Some(active) if active.label == label => {
                let out_of_order = snapshot.timestamp < active.newest;
                self.write_record(label, snapshot)?;
                self.active = Some(ActiveSlot {
                    label,
                    newest: active.newest.max(snapshot.timestamp),
                });
                AppendOutcome {
                    label,
                    rotated: false,
                    sealed: None,
                    out_of_order,
                }
            }
            Some(active) if label.start() > active.label.start() => {
                self.write_record(label, snapshot)?;
                info!(asset = %self.store.asset(), sealed = %active.label, opened = %label,
                      "partition sealed on slot rotation");
                self.active = Some(ActiveSlot {
                    label,
                    newest: snapshot.timestamp,
                });
                AppendOutcome {
                    label,
                    rotated: true,
                    sealed: Some(active.label),
                    out_of_order: false,
                }
            }
            Some(_) => {
                // Record belongs to an already-passed slot; keep the active
                // cursor and file the record where its timestamp says.
                self.write_record(label, snapshot)?;
                AppendOutcome {
                    label,
                    rotated: false,
                    sealed: None,
                    out_of_order: true,
                }
            }
        };

        if outcome.out_of_order {
            self.out_of_order_total += 1;
            warn!(asset = %self.store.asset(), slot = %outcome.label,
                  total = self.out_of_order_total, "out-of-order snapshot appended");
        }

        Ok(outcome)
    }

    fn write_record(&self, label: SlotLabel, snapshot: &Snapshot) -> Result<(), WriteError> {
        let path = self.store.partition_path(label);
        let is_new = !path.exists();
        let line = encode_record(snapshot)?;

        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        if is_new {
            writeln!(file, "{PARTITION_HEADER}")?;
        }
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Encode one snapshot as a partition line in the stable column order.
pub fn encode_record(snapshot: &Snapshot) -> Result<String, WriteError> {
    for (field, value) in [
        ("asset", snapshot.asset.as_str()),
        ("exchange", snapshot.exchange.as_str()),
    ] {
        if value.contains(',') || value.contains('\n') {
            return Err(WriteError::Encode {
                reason: format!("field '{field}' contains a delimiter: '{value}'"),
            });
        }
    }

    Ok(format!(
        "{},{},{},{},{},{},{},{},{},{}",
        snapshot.timestamp.format_rfc3339(),
        snapshot.asset,
        snapshot.exchange,
        snapshot.price,
        snapshot.bid,
        snapshot.ask,
        snapshot.spread,
        snapshot.volume,
        snapshot.spread_avg,
        snapshot.spread_avg_pct,
    ))
}

/// Decode one partition line; the error is a human-readable reason.
pub fn decode_record(line: &str) -> Result<Snapshot, String> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != FIELD_COUNT {
        return Err(format!(
            "expected {FIELD_COUNT} fields, found {}",
            fields.len()
        ));
    }

    let timestamp = UtcInstant::parse(fields[0]).map_err(|e| e.to_string())?;
    let asset = AssetId::parse(fields[1]).map_err(|e| e.to_string())?;
    let exchange = fields[2].to_owned();
    let numeric: Vec<f64> = fields[3..]
        .iter()
        .map(|raw| raw.parse::<f64>().map_err(|e| format!("'{raw}': {e}")))
        .collect::<Result<_, _>>()?;

    Snapshot::new(
        timestamp, asset, exchange, numeric[0], numeric[1], numeric[2], numeric[3], numeric[4],
        numeric[5], numeric[6],
    )
    .map_err(|e| e.to_string())
}
