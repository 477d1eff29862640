//! Behavior-driven tests for view aggregation
//!
//! These tests verify WHAT chart consumers observe: idempotent rebuilds,
//! window correctness, resampling and smoothing, and the published view
//! file set.

use tempfile::tempdir;

use ticklog_core::{
    Aggregator, AggregatorSettings, AssetId, ChartPoint, DailyPoint, PartitionStore,
    PartitionWriter, RebuildScope, SlotSpec, Snapshot, UtcInstant, ViewKind,
};
use ticklog_tests::snapshot_at;

fn aggregator_over(dir: &std::path::Path, inputs: &[Snapshot]) -> Aggregator {
    let store = PartitionStore::open(
        dir,
        AssetId::parse("ADA-USD").expect("valid pair"),
        SlotSpec::new(8).expect("valid width"),
    )
    .expect("store opens");
    let mut writer = PartitionWriter::open(store.clone()).expect("writer opens");
    for input in inputs {
        writer.append(input).expect("append");
    }
    Aggregator::new(
        store,
        AggregatorSettings {
            exchange: String::from("Coinbase"),
            recent_window: time::Duration::hours(24),
            bucket_secs: 60,
            ma_windows: vec![50, 100, 200],
            poll_interval: std::time::Duration::from_secs(1),
        },
    )
}

fn points(generation: &ticklog_core::Generation, kind: ViewKind) -> Vec<ChartPoint> {
    serde_json::from_slice(generation.view_bytes(kind).expect("view exists"))
        .expect("chart points parse")
}

fn daily_points(generation: &ticklog_core::Generation, date: &str) -> Vec<DailyPoint> {
    let day = UtcInstant::parse(&format!("{date}T00:00:00Z"))
        .expect("valid date")
        .date();
    serde_json::from_slice(
        generation
            .view_bytes(ViewKind::Daily(day))
            .expect("daily view exists"),
    )
    .expect("daily points parse")
}

// =============================================================================
// Idempotence and ordering
// =============================================================================

#[test]
fn when_the_same_partitions_are_rebuilt_twice_the_views_are_byte_identical() {
    // Given: a fixed partition set
    let dir = tempdir().expect("tempdir");
    let aggregator = aggregator_over(
        dir.path(),
        &[
            snapshot_at("ADA-USD", "2025-07-18T08:00:00Z", 0.85),
            snapshot_at("ADA-USD", "2025-07-18T08:01:30Z", 0.86),
            snapshot_at("ADA-USD", "2025-07-17T22:00:00Z", 0.84),
        ],
    );
    let now = UtcInstant::parse("2025-07-18T09:00:00Z").expect("valid");

    // When: a full rebuild runs twice with the same injected now
    let first = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("rebuild");
    let second = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("rebuild");

    // Then: all chart views are byte-identical (metadata and index carry
    // the point-in-time generation stamp and are compared structurally)
    for kind in [ViewKind::Historical, ViewKind::Recent] {
        assert_eq!(first.view_bytes(kind), second.view_bytes(kind));
    }
    for date in ["2025-07-17", "2025-07-18"] {
        assert_eq!(daily_points(&first, date), daily_points(&second, date));
    }
    assert_eq!(first.stats(), second.stats());
}

#[test]
fn when_appends_were_out_of_order_every_view_is_still_sorted_by_time() {
    // Given: a late arrival behind two newer records
    let dir = tempdir().expect("tempdir");
    let aggregator = aggregator_over(
        dir.path(),
        &[
            snapshot_at("ADA-USD", "2025-07-18T08:00:00Z", 0.85),
            snapshot_at("ADA-USD", "2025-07-18T08:00:01Z", 0.86),
            snapshot_at("ADA-USD", "2025-07-18T07:59:59Z", 0.84),
        ],
    );
    let now = UtcInstant::parse("2025-07-18T09:00:00Z").expect("valid");

    // When: views are rebuilt
    let generation = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("rebuild");

    // Then: historical output is exactly the time-sorted sequence
    let historical = points(&generation, ViewKind::Historical);
    let times: Vec<String> = historical
        .iter()
        .map(|point| point.time.format_rfc3339())
        .collect();
    assert_eq!(
        times,
        vec![
            "2025-07-18T07:59:59Z",
            "2025-07-18T08:00:00Z",
            "2025-07-18T08:00:01Z",
        ]
    );

    // And: the recent view is sorted too
    let recent = points(&generation, ViewKind::Recent);
    for pair in recent.windows(2) {
        assert!(pair[0].time <= pair[1].time);
    }
}

// =============================================================================
// Window correctness
// =============================================================================

#[test]
fn recent_view_is_exactly_the_last_24_hours_of_historical() {
    // Given: data older and younger than the window, for several nows
    let dir = tempdir().expect("tempdir");
    let aggregator = aggregator_over(
        dir.path(),
        &[
            snapshot_at("ADA-USD", "2025-07-15T10:00:00Z", 0.80),
            snapshot_at("ADA-USD", "2025-07-16T10:00:00Z", 0.81),
            snapshot_at("ADA-USD", "2025-07-17T10:00:00Z", 0.82),
            snapshot_at("ADA-USD", "2025-07-18T08:00:00Z", 0.85),
        ],
    );

    // Note: the window has no upper bound, so with an injected past
    // `now` the records after it still qualify.
    for (now, expected_len) in [
        ("2025-07-18T09:00:00Z", 2),
        ("2025-07-17T10:00:00Z", 3),
        ("2025-07-16T10:30:00Z", 3),
    ] {
        let now = UtcInstant::parse(now).expect("valid");

        // When: views are rebuilt at this now
        let generation = aggregator
            .rebuild(RebuildScope::Full, now, None, None)
            .expect("rebuild");

        // Then: recent equals the windowed subset of historical
        let historical = points(&generation, ViewKind::Historical);
        let recent = points(&generation, ViewKind::Recent);
        let cutoff = now - time::Duration::hours(24);
        let expected: Vec<ChartPoint> = historical
            .into_iter()
            .filter(|point| point.time >= cutoff)
            .collect();
        assert_eq!(recent, expected, "now = {now}");
        assert_eq!(recent.len(), expected_len, "now = {now}");
    }
}

// =============================================================================
// Daily resampling and smoothing
// =============================================================================

#[test]
fn sparse_input_still_yields_gapless_daily_buckets_and_defined_mas() {
    // Given: three observations with multi-minute gaps
    let dir = tempdir().expect("tempdir");
    let aggregator = aggregator_over(
        dir.path(),
        &[
            snapshot_at("ADA-USD", "2025-07-18T08:00:10Z", 0.85),
            snapshot_at("ADA-USD", "2025-07-18T08:04:50Z", 0.90),
            snapshot_at("ADA-USD", "2025-07-18T08:07:05Z", 0.95),
        ],
    );
    let now = UtcInstant::parse("2025-07-18T09:00:00Z").expect("valid");

    // When: the daily view is rebuilt
    let generation = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("rebuild");
    let daily = daily_points(&generation, "2025-07-18");

    // Then: the bucket grid is contiguous from 08:00 through 08:07
    assert_eq!(daily.len(), 8);
    for (index, point) in daily.iter().enumerate() {
        let expected = format!("2025-07-18T08:0{index}:00Z");
        assert_eq!(point.point.time.format_rfc3339(), expected);
    }

    // And: interior gaps carry the previous bucket's closing values
    assert_eq!(daily[1].point.price, 0.85);
    assert_eq!(daily[3].point.price, 0.85);
    assert_eq!(daily[4].point.price, 0.90);
    assert_eq!(daily[5].point.price, 0.90);
    assert_eq!(daily[7].point.price, 0.95);

    // And: every bucket carries every configured smoothing window
    for point in &daily {
        for window in [50, 100, 200] {
            let key = format!("ma_{window}");
            let value = point.smoothing.get(&key).copied();
            assert!(
                value.is_some() && value.expect("checked").is_finite(),
                "bucket {} must define {key}",
                point.point.time
            );
        }
    }
}

#[test]
fn moving_averages_average_over_the_available_prefix() {
    // Given: four buckets of known spread percentages
    let dir = tempdir().expect("tempdir");
    let mut inputs = Vec::new();
    for (minute, pct) in [(0u8, 1.0f64), (1, 2.0), (2, 3.0), (3, 4.0)] {
        let ts = format!("2025-07-18T08:0{minute}:00Z");
        let mut snapshot = snapshot_at("ADA-USD", &ts, 0.85);
        snapshot.spread_avg_pct = pct;
        inputs.push(snapshot);
    }
    let aggregator = aggregator_over(dir.path(), &inputs);
    let now = UtcInstant::parse("2025-07-18T09:00:00Z").expect("valid");

    // When: the daily view is rebuilt
    let generation = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("rebuild");
    let daily = daily_points(&generation, "2025-07-18");

    // Then: a 50-bucket window over 4 buckets averages what exists
    let expected = [1.0, 1.5, 2.0, 2.5];
    for (point, expected) in daily.iter().zip(expected) {
        assert!((point.smoothing["ma_50"] - expected).abs() < 1e-12);
        assert!((point.smoothing["ma_200"] - expected).abs() < 1e-12);
    }
}

#[test]
fn a_new_day_inherits_the_previous_days_final_bucket() {
    // Given: a day boundary with data on both sides
    let dir = tempdir().expect("tempdir");
    let aggregator = aggregator_over(
        dir.path(),
        &[
            snapshot_at("ADA-USD", "2025-07-17T23:58:40Z", 0.80),
            snapshot_at("ADA-USD", "2025-07-18T00:03:20Z", 0.90),
        ],
    );
    let now = UtcInstant::parse("2025-07-18T01:00:00Z").expect("valid");

    // When: views are rebuilt
    let generation = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("rebuild");

    // Then: the new day's leading buckets are forward-filled from the
    // previous day's close, never backward-filled from 00:03
    let daily = daily_points(&generation, "2025-07-18");
    assert_eq!(daily.len(), 4);
    assert_eq!(daily[0].point.time.format_rfc3339(), "2025-07-18T00:00:00Z");
    for filled in &daily[..3] {
        assert_eq!(filled.point.price, 0.80);
    }
    assert_eq!(daily[3].point.price, 0.90);
}

// =============================================================================
// Published artifacts
// =============================================================================

#[test]
fn a_rebuild_writes_the_complete_view_file_set() {
    // Given: one day of data
    let dir = tempdir().expect("tempdir");
    let aggregator = aggregator_over(
        dir.path(),
        &[snapshot_at("ADA-USD", "2025-07-18T08:00:00Z", 0.85)],
    );
    let now = UtcInstant::parse("2025-07-18T09:00:00Z").expect("valid");

    // When: views are rebuilt
    let generation = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("rebuild");

    // Then: the on-disk view set matches the original service's layout
    let views = dir.path().join("ada-usd/views");
    for file in [
        "historical.json",
        "recent.json",
        "output_2025-07-18.json",
        "metadata.json",
        "index.json",
    ] {
        assert!(views.join(file).exists(), "{file} must exist");
    }

    // And: the index enumerates partitions and daily views
    let index: serde_json::Value =
        serde_json::from_slice(generation.view_bytes(ViewKind::Index).expect("index"))
            .expect("index parses");
    assert_eq!(index["partitions"][0], "2025-07-18_08.csv");
    assert_eq!(index["daily_files"][0], "output_2025-07-18.json");

    // And: metadata reports identity, counts, and range
    let metadata: serde_json::Value =
        serde_json::from_slice(generation.view_bytes(ViewKind::Metadata).expect("metadata"))
            .expect("metadata parses");
    assert_eq!(metadata["asset"], "ADA-USD");
    assert_eq!(metadata["exchange"], "Coinbase");
    assert_eq!(metadata["total_records"], 1);
    assert_eq!(metadata["date_range"]["start"], "2025-07-18T08:00:00Z");
    assert_eq!(metadata["date_range"]["end"], "2025-07-18T08:00:00Z");
}

#[test]
fn incremental_rebuilds_keep_historical_until_the_next_seal() {
    // Given: a published full generation
    let dir = tempdir().expect("tempdir");
    let aggregator = aggregator_over(
        dir.path(),
        &[snapshot_at("ADA-USD", "2025-07-18T08:00:00Z", 0.85)],
    );
    let now = UtcInstant::parse("2025-07-18T08:01:00Z").expect("valid");
    let full = aggregator
        .rebuild(RebuildScope::Full, now, None, None)
        .expect("full rebuild");

    // When: a new record is appended and rebuilt incrementally
    let extra = snapshot_at("ADA-USD", "2025-07-18T08:00:30Z", 0.86);
    let store = PartitionStore::open(
        dir.path(),
        AssetId::parse("ADA-USD").expect("valid pair"),
        SlotSpec::new(8).expect("valid width"),
    )
    .expect("store opens");
    let mut writer = PartitionWriter::open(store).expect("writer opens");
    writer.append(&extra).expect("append");

    let later = UtcInstant::parse("2025-07-18T08:02:00Z").expect("valid");
    let incremental = aggregator
        .rebuild(RebuildScope::Incremental, later, Some(&full), Some(&extra))
        .expect("incremental rebuild");

    // Then: historical bytes are carried forward unchanged while the
    // bounded views move ahead
    assert_eq!(
        incremental.view_bytes(ViewKind::Historical),
        full.view_bytes(ViewKind::Historical)
    );
    assert_eq!(points(&incremental, ViewKind::Recent).len(), 2);
    assert_eq!(incremental.stats().total_records, 2);
}
