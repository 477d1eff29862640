//! Derived chart views rebuilt from partitions.
//!
//! The aggregator is a pure function of partition contents: loading,
//! stable-sorting by timestamp, and projecting into the view set served
//! to chart clients — `historical.json` (full sequence), `recent.json`
//! (rolling window), `output_<date>.json` (per-day minute buckets with
//! moving averages), `metadata.json` and `index.json`. All views of one
//! rebuild are grouped into a [`Generation`] and published atomically;
//! readers always see a complete generation, never a mix of two.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, Duration};
use tracing::debug;
use uuid::Uuid;

use crate::domain::timestamp::format_date;
use crate::partition::{PartitionStore, WriteError};
use crate::{Snapshot, UtcInstant};

/// How much of the partition set a rebuild has to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildScope {
    /// Refresh the bounded views (recent, touched days, metadata, index);
    /// the historical view is carried forward from the previous
    /// generation.
    Incremental,
    /// Recompute every view from every partition.
    Full,
}

/// One of the derived views served to chart clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Historical,
    Recent,
    Daily(Date),
    Metadata,
    Index,
}

impl ViewKind {
    /// File name of the view inside the asset's `views/` directory.
    pub fn file_name(self) -> String {
        match self {
            Self::Historical => String::from("historical.json"),
            Self::Recent => String::from("recent.json"),
            Self::Daily(date) => format!("output_{}.json", format_date(date)),
            Self::Metadata => String::from("metadata.json"),
            Self::Index => String::from("index.json"),
        }
    }
}

/// One chart row: the shape consumed by the chart clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub time: UtcInstant,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub volume: f64,
}

impl ChartPoint {
    fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            time: snapshot.timestamp,
            price: snapshot.price,
            bid: snapshot.bid,
            ask: snapshot.ask,
            spread: snapshot.spread,
            spread_pct: snapshot.spread_avg_pct,
            volume: snapshot.volume,
        }
    }
}

/// One daily-view row: a resampled bucket plus its smoothing fields
/// (`ma_<window>` keys, always present once the bucket exists).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    #[serde(flatten)]
    pub point: ChartPoint,
    #[serde(flatten)]
    pub smoothing: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct MetadataDoc<'a> {
    generated_at: UtcInstant,
    asset: &'a str,
    exchange: &'a str,
    total_records: u64,
    date_range: DateRange,
    partitions_processed: usize,
    update_frequency: String,
    file_rotation: String,
}

#[derive(Debug, Serialize)]
struct DateRange {
    start: Option<UtcInstant>,
    end: Option<UtcInstant>,
}

#[derive(Debug, Serialize)]
struct IndexDoc {
    generated_at: UtcInstant,
    partitions: Vec<String>,
    daily_files: Vec<String>,
    chart_files: [&'static str; 2],
    metadata_files: [&'static str; 2],
}

/// Running dataset totals carried across incremental generations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationStats {
    pub total_records: u64,
    pub first: Option<UtcInstant>,
    pub last: Option<UtcInstant>,
}

impl GenerationStats {
    fn fold(mut self, snapshot: &Snapshot) -> Self {
        self.total_records += 1;
        self.first = Some(match self.first {
            Some(first) => first.min(snapshot.timestamp),
            None => snapshot.timestamp,
        });
        self.last = Some(match self.last {
            Some(last) => last.max(snapshot.timestamp),
            None => snapshot.timestamp,
        });
        self
    }

    fn from_sorted(snapshots: &[Snapshot]) -> Self {
        Self {
            total_records: snapshots.len() as u64,
            first: snapshots.first().map(|s| s.timestamp),
            last: snapshots.last().map(|s| s.timestamp),
        }
    }
}

/// One atomically published version of the full view set for an asset.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: Uuid,
    pub generated_at: UtcInstant,
    historical: Arc<Vec<u8>>,
    recent: Arc<Vec<u8>>,
    daily: BTreeMap<Date, Arc<Vec<u8>>>,
    metadata: Arc<Vec<u8>>,
    index: Arc<Vec<u8>>,
    stats: GenerationStats,
    /// Final bucket of each day, used for midnight forward-fill by the
    /// next incremental rebuild.
    daily_carry: BTreeMap<Date, ChartPoint>,
}

impl Generation {
    pub fn view_bytes(&self, kind: ViewKind) -> Option<&[u8]> {
        match kind {
            ViewKind::Historical => Some(self.historical.as_slice()),
            ViewKind::Recent => Some(self.recent.as_slice()),
            ViewKind::Daily(date) => self.daily.get(&date).map(|bytes| bytes.as_slice()),
            ViewKind::Metadata => Some(self.metadata.as_slice()),
            ViewKind::Index => Some(self.index.as_slice()),
        }
    }

    pub fn stats(&self) -> GenerationStats {
        self.stats
    }

    pub fn daily_dates(&self) -> impl Iterator<Item = Date> + '_ {
        self.daily.keys().copied()
    }

    /// View file names of this generation, relative to the asset data
    /// directory (the sync pusher's dirty set).
    pub fn view_files(&self) -> Vec<String> {
        let mut files = vec![
            format!("views/{}", ViewKind::Historical.file_name()),
            format!("views/{}", ViewKind::Recent.file_name()),
        ];
        files.extend(
            self.daily
                .keys()
                .map(|date| format!("views/{}", ViewKind::Daily(*date).file_name())),
        );
        files.push(format!("views/{}", ViewKind::Metadata.file_name()));
        files.push(format!("views/{}", ViewKind::Index.file_name()));
        files
    }
}

/// Errors raised while rebuilding views.
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error(transparent)]
    Storage(#[from] WriteError),

    #[error("failed to serialize view: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Settings the aggregator needs beyond the partition store itself.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub exchange: String,
    pub recent_window: Duration,
    pub bucket_secs: u64,
    pub ma_windows: Vec<usize>,
    pub poll_interval: std::time::Duration,
}

/// Rebuilds the derived view set from partition contents.
#[derive(Debug)]
pub struct Aggregator {
    store: PartitionStore,
    views_dir: PathBuf,
    settings: AggregatorSettings,
}

impl Aggregator {
    pub fn new(store: PartitionStore, settings: AggregatorSettings) -> Self {
        let views_dir = store.root().join("views");
        Self {
            store,
            views_dir,
            settings,
        }
    }

    pub fn views_dir(&self) -> &PathBuf {
        &self.views_dir
    }

    /// Rebuild the view set.
    ///
    /// `now` anchors the rolling recent window (injected for determinism),
    /// `prev` is the previously published generation, and `appended` is
    /// the snapshot whose append triggered this rebuild, if any. The
    /// returned generation has every view file already durable on disk;
    /// the caller publishes the generation pointer afterwards.
    pub fn rebuild(
        &self,
        scope: RebuildScope,
        now: UtcInstant,
        prev: Option<&Generation>,
        appended: Option<&Snapshot>,
    ) -> Result<Generation, RebuildError> {
        // The first rebuild has nothing to carry forward.
        let scope = match (scope, prev) {
            (RebuildScope::Incremental, None) => RebuildScope::Full,
            (scope, _) => scope,
        };

        let generation = match scope {
            RebuildScope::Full => self.rebuild_full(now)?,
            RebuildScope::Incremental => self.rebuild_incremental(
                now,
                prev.expect("incremental scope requires a previous generation"),
                appended,
            )?,
        };

        self.write_view_files(&generation)?;
        debug!(asset = %self.store.asset(), generation = %generation.id,
               records = generation.stats.total_records, "view generation rebuilt");
        Ok(generation)
    }

    fn rebuild_full(&self, now: UtcInstant) -> Result<Generation, RebuildError> {
        let mut snapshots = self.store.load_all()?;
        sort_stable(&mut snapshots);

        let stats = GenerationStats::from_sorted(&snapshots);
        let historical = to_chart_points(&snapshots);
        let recent = recent_points(&snapshots, now, self.settings.recent_window);

        let (daily, daily_carry) = self.resample_all_days(&snapshots)?;

        self.assemble(now, stats, to_json(&historical)?, to_json(&recent)?, daily, daily_carry)
    }

    fn rebuild_incremental(
        &self,
        now: UtcInstant,
        prev: &Generation,
        appended: Option<&Snapshot>,
    ) -> Result<Generation, RebuildError> {
        let cutoff = now - self.settings.recent_window;
        // An out-of-order append can touch a day older than the recent
        // window; widen the load so that day is rebuilt from all its data.
        let load_from = match appended {
            Some(snapshot) => {
                let day_start = UtcInstant::from_offset_datetime(
                    snapshot
                        .timestamp
                        .date()
                        .midnight()
                        .assume_utc(),
                )
                .expect("midnight UTC is valid");
                cutoff.min(day_start)
            }
            None => cutoff,
        };

        let mut window = self.store.load_covering(load_from)?;
        sort_stable(&mut window);

        let recent = recent_points(&window, now, self.settings.recent_window);

        let mut daily = prev.daily.clone();
        let mut daily_carry = prev.daily_carry.clone();
        if let Some(snapshot) = appended {
            let day = snapshot.timestamp.date();
            let day_snapshots: Vec<&Snapshot> =
                window.iter().filter(|s| s.timestamp.date() == day).collect();
            let carry = day.previous_day().and_then(|prev_day| {
                daily_carry.get(&prev_day).cloned()
            });
            let points = resample_day(
                &day_snapshots,
                carry,
                self.settings.bucket_secs,
                &self.settings.ma_windows,
            );
            if let Some(last) = points.last() {
                daily_carry.insert(day, last.point.clone());
            }
            daily.insert(day, Arc::new(to_json(&points)?));
        }

        let stats = match appended {
            Some(snapshot) => prev.stats.fold(snapshot),
            None => prev.stats,
        };

        let mut generation = self.assemble(
            now,
            stats,
            Vec::new(),
            to_json(&recent)?,
            daily,
            daily_carry,
        )?;
        // Historical is rate-limited to full rebuilds; reuse the bytes.
        generation.historical = Arc::clone(&prev.historical);
        Ok(generation)
    }

    fn assemble(
        &self,
        now: UtcInstant,
        stats: GenerationStats,
        historical_json: Vec<u8>,
        recent_json: Vec<u8>,
        daily: BTreeMap<Date, Arc<Vec<u8>>>,
        daily_carry: BTreeMap<Date, ChartPoint>,
    ) -> Result<Generation, RebuildError> {
        let partitions: Vec<String> = self
            .store
            .list()?
            .iter()
            .map(|partition| partition.file_name())
            .collect();

        let metadata = MetadataDoc {
            generated_at: now,
            asset: self.store.asset().as_str(),
            exchange: &self.settings.exchange,
            total_records: stats.total_records,
            date_range: DateRange {
                start: stats.first,
                end: stats.last,
            },
            partitions_processed: partitions.len(),
            update_frequency: format!("{}s", self.settings.poll_interval.as_secs().max(1)),
            file_rotation: format!("{} hour slots", self.store.spec().width_hours()),
        };

        let index = IndexDoc {
            generated_at: now,
            partitions,
            daily_files: daily
                .keys()
                .map(|date| ViewKind::Daily(*date).file_name())
                .collect(),
            chart_files: ["historical.json", "recent.json"],
            metadata_files: ["metadata.json", "index.json"],
        };

        Ok(Generation {
            id: Uuid::new_v4(),
            generated_at: now,
            historical: Arc::new(historical_json),
            recent: Arc::new(recent_json),
            daily,
            metadata: Arc::new(serde_json::to_vec_pretty(&metadata)?),
            index: Arc::new(serde_json::to_vec_pretty(&index)?),
            stats,
            daily_carry,
        })
    }

    fn resample_all_days(
        &self,
        sorted: &[Snapshot],
    ) -> Result<(BTreeMap<Date, Arc<Vec<u8>>>, BTreeMap<Date, ChartPoint>), RebuildError> {
        let mut by_day: BTreeMap<Date, Vec<&Snapshot>> = BTreeMap::new();
        for snapshot in sorted {
            by_day
                .entry(snapshot.timestamp.date())
                .or_default()
                .push(snapshot);
        }

        let mut daily = BTreeMap::new();
        let mut carry_map: BTreeMap<Date, ChartPoint> = BTreeMap::new();
        let mut previous: Option<(Date, ChartPoint)> = None;

        for (day, snapshots) in by_day {
            // Carry applies only across adjacent calendar days.
            let carry = previous
                .as_ref()
                .filter(|(prev_day, _)| prev_day.next_day() == Some(day))
                .map(|(_, point)| point.clone());

            let points = resample_day(
                &snapshots,
                carry,
                self.settings.bucket_secs,
                &self.settings.ma_windows,
            );
            if let Some(last) = points.last() {
                previous = Some((day, last.point.clone()));
                carry_map.insert(day, last.point.clone());
            }
            daily.insert(day, Arc::new(to_json(&points)?));
        }

        Ok((daily, carry_map))
    }

    /// Write every view of the generation under `views/`, each through a
    /// temp file + rename so a crash never leaves a torn view on disk.
    fn write_view_files(&self, generation: &Generation) -> Result<(), RebuildError> {
        std::fs::create_dir_all(&self.views_dir).map_err(WriteError::from)?;

        let mut writes: Vec<(String, &[u8])> = vec![
            (
                ViewKind::Historical.file_name(),
                generation.historical.as_slice(),
            ),
            (ViewKind::Recent.file_name(), generation.recent.as_slice()),
            (
                ViewKind::Metadata.file_name(),
                generation.metadata.as_slice(),
            ),
            (ViewKind::Index.file_name(), generation.index.as_slice()),
        ];
        for (date, bytes) in &generation.daily {
            writes.push((ViewKind::Daily(*date).file_name(), bytes.as_slice()));
        }

        for (file_name, bytes) in writes {
            let final_path = self.views_dir.join(&file_name);
            let tmp_path = self.views_dir.join(format!(".{file_name}.tmp"));
            let mut file = std::fs::File::create(&tmp_path).map_err(WriteError::from)?;
            file.write_all(bytes).map_err(WriteError::from)?;
            file.flush().map_err(WriteError::from)?;
            std::fs::rename(&tmp_path, &final_path).map_err(WriteError::from)?;
        }

        Ok(())
    }
}

/// Stable sort by timestamp; ties keep arrival order. This is the point
/// where out-of-order appends are corrected.
fn sort_stable(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}

fn to_chart_points(sorted: &[Snapshot]) -> Vec<ChartPoint> {
    sorted.iter().map(ChartPoint::from_snapshot).collect()
}

fn recent_points(sorted: &[Snapshot], now: UtcInstant, window: Duration) -> Vec<ChartPoint> {
    let cutoff = now - window;
    sorted
        .iter()
        .filter(|snapshot| snapshot.timestamp >= cutoff)
        .map(ChartPoint::from_snapshot)
        .collect()
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(value)
}

#[derive(Debug, Default)]
struct BucketAccum {
    close: Option<ChartPoint>,
    spread_sum: f64,
    spread_pct_sum: f64,
    volume_sum: f64,
    count: u64,
}

/// Resample one day's snapshots into fixed buckets and attach moving
/// averages.
///
/// Buckets run from the day's first observation (or from midnight when a
/// previous-day carry exists) through the last observation; interior gaps
/// are forward-filled from the previous bucket's closing values, never
/// backward-filled. Moving averages are computed over the resampled
/// `spread_pct` series; a window longer than the available prefix averages
/// over what exists, so every emitted bucket has defined smoothing fields.
fn resample_day(
    snapshots: &[&Snapshot],
    carry: Option<ChartPoint>,
    bucket_secs: u64,
    ma_windows: &[usize],
) -> Vec<DailyPoint> {
    let mut buckets: BTreeMap<i64, BucketAccum> = BTreeMap::new();
    for &snapshot in snapshots {
        let floor = snapshot.timestamp.floor_to_seconds(bucket_secs);
        let accum = buckets.entry(floor.unix_timestamp()).or_default();
        accum.close = Some(ChartPoint {
            time: floor,
            ..ChartPoint::from_snapshot(snapshot)
        });
        accum.spread_sum += snapshot.spread;
        accum.spread_pct_sum += snapshot.spread_avg_pct;
        accum.volume_sum += snapshot.volume;
        accum.count += 1;
    }

    let (first_key, last_key) = match (buckets.keys().next(), buckets.keys().next_back()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Vec::new(),
    };

    let day_start = snapshots[0]
        .timestamp
        .floor_to_seconds(86_400)
        .unix_timestamp();
    let grid_start = if carry.is_some() { day_start } else { first_key };

    let mut points: Vec<ChartPoint> = Vec::new();
    let mut last_close = carry;
    let step = bucket_secs as i64;
    let mut key = grid_start;
    while key <= last_key {
        let time = UtcInstant::from_unix_timestamp(key).expect("bucket epoch is valid");
        match buckets.get(&key) {
            Some(accum) => {
                let close = accum.close.clone().expect("bucket with data has a close");
                let divisor = accum.count.max(1) as f64;
                let point = ChartPoint {
                    time,
                    price: close.price,
                    bid: close.bid,
                    ask: close.ask,
                    spread: accum.spread_sum / divisor,
                    spread_pct: accum.spread_pct_sum / divisor,
                    volume: accum.volume_sum,
                };
                last_close = Some(point.clone());
                points.push(point);
            }
            None => {
                if let Some(previous) = &last_close {
                    points.push(ChartPoint {
                        time,
                        ..previous.clone()
                    });
                }
            }
        }
        key += step;
    }

    let series: Vec<f64> = points.iter().map(|point| point.spread_pct).collect();
    points
        .into_iter()
        .enumerate()
        .map(|(index, point)| {
            let smoothing = ma_windows
                .iter()
                .map(|&window| {
                    let from = (index + 1).saturating_sub(window);
                    let slice = &series[from..=index];
                    let mean = slice.iter().sum::<f64>() / slice.len() as f64;
                    (format!("ma_{window}"), mean)
                })
                .collect();
            DailyPoint { point, smoothing }
        })
        .collect()
}
