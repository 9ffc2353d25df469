//! Parquet partition store.
//!
//! Layout:
//!
//! ```text
//! {root}/{dataset_type}/{partition_key}.parquet            canonical, overwritten
//! {root}/{dataset_type}/{partition_key}.meta.json          sidecar
//! {root}/{dataset_type}/_snapshots/{partition_key}/{ts}.parquet   optional, append-only
//! ```
//!
//! The canonical path depends only on `(dataset_type, partition_key)`. Writes
//! go to a `.tmp` file and are renamed into place; the snapshot and sidecar are
//! prepared first, so a write that reports failure leaves the previous
//! partition untouched.

use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{DatasetType, Frequency, NormalizedRecord, RecordValues};

const SNAPSHOT_DIR: &str = "_snapshots";
const FLAG_SEPARATOR: char = ';';

const BASE_COLUMNS: [&str; 9] = [
    "entity_id",
    "timestamp",
    "dataset_type",
    "dataset_id",
    "frequency",
    "unit",
    "source",
    "collection_timestamp",
    "quality_flags",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("refusing to write an empty batch to {}", .path.display())]
    EmptyBatch { path: PathBuf },

    #[error("batch for {} contains {found} records", .path.display())]
    DatasetMismatch { path: PathBuf, found: DatasetType },

    #[error("storage unreachable at {}: {cause}", .path.display())]
    Unreachable { path: PathBuf, cause: String },

    #[error("parquet error at {}: {cause}", .path.display())]
    Parquet { path: PathBuf, cause: String },

    #[error("no stored partition at {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("corrupt partition at {}: {cause}", .path.display())]
    Corrupt { path: PathBuf, cause: String },
}

impl StorageError {
    /// The path the failed operation targeted.
    pub fn path(&self) -> &Path {
        match self {
            StorageError::EmptyBatch { path }
            | StorageError::DatasetMismatch { path, .. }
            | StorageError::Unreachable { path, .. }
            | StorageError::Parquet { path, .. }
            | StorageError::NotFound { path }
            | StorageError::Corrupt { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub path: PathBuf,
    /// Rows written after dedup.
    pub record_count: usize,
    /// Whether a previous canonical file was replaced.
    pub overwritten: bool,
    pub snapshot: Option<PathBuf>,
}

/// Sidecar written next to each canonical partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub dataset_type: DatasetType,
    pub partition_key: String,
    pub record_count: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub data_hash: String,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub path: PathBuf,
    pub meta: PartitionMeta,
}

/// Storage key for an entity: separators in the entity id become `_`, suffixed
/// by the dataset type slug (`BHP.AX` + OHLCV -> `BHP_AX_ohlcv`).
pub fn partition_key(entity_id: &str, dataset_type: DatasetType) -> String {
    let entity: String = entity_id
        .trim()
        .chars()
        .map(|c| match c {
            '.' | '/' | '\\' | ' ' | ':' => '_',
            c => c,
        })
        .collect();
    format!("{entity}_{}", dataset_type.slug())
}

#[derive(Debug, Clone)]
pub struct ParquetStore {
    root: PathBuf,
    snapshots: bool,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshots: false,
        }
    }

    /// Also keep a timestamped copy of every write.
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshots = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dataset_dir(&self, dataset_type: DatasetType) -> PathBuf {
        self.root.join(dataset_type.slug())
    }

    /// Canonical location of a partition.
    pub fn partition_path(&self, dataset_type: DatasetType, partition_key: &str) -> PathBuf {
        self.dataset_dir(dataset_type)
            .join(format!("{partition_key}.parquet"))
    }

    fn meta_path(&self, dataset_type: DatasetType, partition_key: &str) -> PathBuf {
        self.dataset_dir(dataset_type)
            .join(format!("{partition_key}.meta.json"))
    }

    fn snapshot_dir(&self, dataset_type: DatasetType, partition_key: &str) -> PathBuf {
        self.dataset_dir(dataset_type)
            .join(SNAPSHOT_DIR)
            .join(partition_key)
    }

    /// Make sure the root exists and accepts writes.
    pub fn check_root(&self) -> Result<(), StorageError> {
        let unreachable = |e: std::io::Error| StorageError::Unreachable {
            path: self.root.clone(),
            cause: e.to_string(),
        };
        fs::create_dir_all(&self.root).map_err(unreachable)?;
        let probe = self.root.join(".write_probe");
        fs::write(&probe, b"").map_err(unreachable)?;
        fs::remove_file(&probe).map_err(unreachable)?;
        Ok(())
    }

    /// Write a batch as the partition's current content.
    ///
    /// Duplicate `(entity_id, timestamp)` pairs keep the last occurrence in
    /// batch order; rows are stored sorted by `(entity_id, timestamp)`.
    pub fn write(
        &self,
        batch: &[NormalizedRecord],
        dataset_type: DatasetType,
        partition_key: &str,
    ) -> Result<WriteResult, StorageError> {
        let path = self.partition_path(dataset_type, partition_key);
        if batch.is_empty() {
            return Err(StorageError::EmptyBatch { path });
        }
        if let Some(other) = batch.iter().find(|r| r.dataset_type != dataset_type) {
            return Err(StorageError::DatasetMismatch {
                path,
                found: other.dataset_type,
            });
        }

        let records = dedup_last(batch);
        if records.len() < batch.len() {
            debug!(
                partition = partition_key,
                dropped = batch.len() - records.len(),
                "dropped duplicate rows"
            );
        }

        let dir = self.dataset_dir(dataset_type);
        fs::create_dir_all(&dir).map_err(|e| StorageError::Unreachable {
            path: dir.clone(),
            cause: e.to_string(),
        })?;

        let mut df = records_to_dataframe(&records, dataset_type).map_err(|e| StorageError::Parquet {
            path: path.clone(),
            cause: e.to_string(),
        })?;

        let meta = PartitionMeta {
            dataset_type,
            partition_key: partition_key.to_string(),
            record_count: records.len(),
            start: records.iter().map(|r| r.timestamp).min().unwrap_or_default(),
            end: records.iter().map(|r| r.timestamp).max().unwrap_or_default(),
            data_hash: content_hash(&records),
            written_at: Utc::now(),
        };
        let meta_path = self.meta_path(dataset_type, partition_key);
        let meta_tmp = meta_path.with_extension("json.tmp");
        let meta_json = serde_json::to_string_pretty(&meta).map_err(|e| StorageError::Corrupt {
            path: meta_path.clone(),
            cause: e.to_string(),
        })?;

        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&mut df, &tmp_path)?;
        fs::write(&meta_tmp, meta_json).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StorageError::Unreachable {
                path: meta_tmp.clone(),
                cause: e.to_string(),
            }
        })?;

        // Everything that can fail goes before the canonical rename.
        let snapshot = if self.snapshots {
            let written = self.write_snapshot(&mut df, dataset_type, partition_key, meta.written_at);
            match written {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    let _ = fs::remove_file(&tmp_path);
                    let _ = fs::remove_file(&meta_tmp);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let overwritten = path.exists();
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            let _ = fs::remove_file(&meta_tmp);
            if let Some(snapshot) = &snapshot {
                let _ = fs::remove_file(snapshot);
            }
            return Err(StorageError::Unreachable {
                path: path.clone(),
                cause: format!("atomic rename failed: {e}"),
            });
        }

        // The partition is committed. A sidecar that cannot be replaced is
        // removed rather than left describing the previous content.
        if let Err(e) = fs::rename(&meta_tmp, &meta_path) {
            warn!(path = %meta_path.display(), error = %e, "metadata sidecar not updated");
            let _ = fs::remove_file(&meta_tmp);
            let _ = fs::remove_file(&meta_path);
        }

        Ok(WriteResult {
            path,
            record_count: records.len(),
            overwritten,
            snapshot,
        })
    }

    fn write_snapshot(
        &self,
        df: &mut DataFrame,
        dataset_type: DatasetType,
        partition_key: &str,
        at: DateTime<Utc>,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.snapshot_dir(dataset_type, partition_key);
        fs::create_dir_all(&dir).map_err(|e| StorageError::Unreachable {
            path: dir.clone(),
            cause: e.to_string(),
        })?;
        let path = dir.join(format!("{}.parquet", at.format("%Y%m%dT%H%M%S%3fZ")));
        let tmp = path.with_extension("parquet.tmp");
        write_parquet(df, &tmp)?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StorageError::Unreachable {
                path: path.clone(),
                cause: format!("atomic rename failed: {e}"),
            }
        })?;
        Ok(path)
    }

    /// Read a partition back, in stored order.
    pub fn load(
        &self,
        dataset_type: DatasetType,
        partition_key: &str,
    ) -> Result<Vec<NormalizedRecord>, StorageError> {
        let path = self.partition_path(dataset_type, partition_key);
        if !path.exists() {
            return Err(StorageError::NotFound { path });
        }
        let file = fs::File::open(&path).map_err(|e| StorageError::Unreachable {
            path: path.clone(),
            cause: e.to_string(),
        })?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| StorageError::Corrupt {
                path: path.clone(),
                cause: e.to_string(),
            })?;
        dataframe_to_records(&df, dataset_type).map_err(|cause| StorageError::Corrupt { path, cause })
    }

    pub fn meta(&self, dataset_type: DatasetType, partition_key: &str) -> Option<PartitionMeta> {
        let content = fs::read_to_string(self.meta_path(dataset_type, partition_key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Every partition with a readable sidecar, grouped by dataset type then key.
    pub fn status(&self) -> Result<Vec<PartitionStatus>, StorageError> {
        let mut out = Vec::new();
        for dataset_type in DatasetType::ALL {
            let dir = self.dataset_dir(dataset_type);
            if !dir.is_dir() {
                continue;
            }
            let entries = fs::read_dir(&dir).map_err(|e| StorageError::Unreachable {
                path: dir.clone(),
                cause: e.to_string(),
            })?;
            let mut keys = BTreeSet::new();
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(key) = name.strip_suffix(".meta.json") {
                    keys.insert(key.to_string());
                }
            }
            for key in keys {
                match self.meta(dataset_type, &key) {
                    Some(meta) => out.push(PartitionStatus {
                        path: self.partition_path(dataset_type, &key),
                        meta,
                    }),
                    None => warn!(dataset = %dataset_type, partition = %key, "unreadable sidecar"),
                }
            }
        }
        Ok(out)
    }

    /// Snapshot files for a partition, oldest first.
    pub fn snapshots(&self, dataset_type: DatasetType, partition_key: &str) -> Vec<PathBuf> {
        let dir = self.snapshot_dir(dataset_type, partition_key);
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("parquet"))
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

/// Keep the last occurrence of each key, then sort by key.
fn dedup_last(batch: &[NormalizedRecord]) -> Vec<NormalizedRecord> {
    let mut last: HashMap<(&str, DateTime<Utc>), usize> = HashMap::with_capacity(batch.len());
    for (i, r) in batch.iter().enumerate() {
        last.insert(r.key(), i);
    }
    let mut keep: Vec<usize> = last.into_values().collect();
    keep.sort_by(|&a, &b| batch[a].key().cmp(&batch[b].key()));
    keep.into_iter().map(|i| batch[i].clone()).collect()
}

fn content_hash(records: &[NormalizedRecord]) -> String {
    let mut hasher = blake3::Hasher::new();
    for r in records {
        if let Ok(bytes) = serde_json::to_vec(r) {
            hasher.update(&bytes);
        }
    }
    hasher.finalize().to_hex().to_string()
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn datetime_column(name: &str, values: Vec<i64>) -> PolarsResult<Column> {
    Column::new(name.into(), values).cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
}

fn records_to_dataframe(
    records: &[NormalizedRecord],
    dataset_type: DatasetType,
) -> PolarsResult<DataFrame> {
    let strings = |f: fn(&NormalizedRecord) -> String| -> Vec<String> { records.iter().map(f).collect() };

    let mut columns = vec![
        Column::new("entity_id".into(), strings(|r| r.entity_id.clone())),
        datetime_column(
            "timestamp",
            records.iter().map(|r| r.timestamp.timestamp_millis()).collect(),
        )?,
        Column::new("dataset_type".into(), strings(|r| r.dataset_type.to_string())),
        Column::new("dataset_id".into(), strings(|r| r.dataset_id.clone())),
        Column::new("frequency".into(), strings(|r| r.frequency.to_string())),
        Column::new(
            "unit".into(),
            records.iter().map(|r| r.unit.clone()).collect::<Vec<Option<String>>>(),
        ),
        Column::new("source".into(), strings(|r| r.source.clone())),
        datetime_column(
            "collection_timestamp",
            records
                .iter()
                .map(|r| r.collection_timestamp.timestamp_millis())
                .collect(),
        )?,
        Column::new(
            "quality_flags".into(),
            strings(|r| r.quality_flags.join(&FLAG_SEPARATOR.to_string())),
        ),
    ];

    let number = |name: &str, f: &dyn Fn(&RecordValues) -> Option<f64>| -> Column {
        Column::new(
            name.into(),
            records.iter().map(|r| f(&r.values)).collect::<Vec<Option<f64>>>(),
        )
    };

    match dataset_type {
        DatasetType::Ohlcv => {
            let field = |idx: usize| {
                move |v: &RecordValues| match v {
                    RecordValues::Ohlcv {
                        open,
                        high,
                        low,
                        close,
                        volume,
                        adj_close,
                    } => [Some(*open), Some(*high), Some(*low), Some(*close), Some(*volume), *adj_close][idx],
                    _ => None,
                }
            };
            for (idx, name) in ["open", "high", "low", "close", "volume", "adj_close"]
                .into_iter()
                .enumerate()
            {
                columns.push(number(name, &field(idx)));
            }
        }
        DatasetType::EconomicIndicator => {
            columns.push(number("value", &|v| match v {
                RecordValues::Economic { value } => Some(*value),
                _ => None,
            }));
        }
        DatasetType::Event => {
            columns.push(Column::new(
                "event_type".into(),
                records
                    .iter()
                    .map(|r| match &r.values {
                        RecordValues::Event { event_type, .. } => Some(event_type.clone()),
                        _ => None,
                    })
                    .collect::<Vec<Option<String>>>(),
            ));
            columns.push(number("value", &|v| match v {
                RecordValues::Event { value, .. } => *value,
                _ => None,
            }));
        }
        DatasetType::Fundamentals => {
            let names: BTreeSet<&str> = records
                .iter()
                .filter_map(|r| match &r.values {
                    RecordValues::Fundamentals { metrics } => Some(metrics.keys().map(String::as_str)),
                    _ => None,
                })
                .flatten()
                .collect();
            for name in names {
                columns.push(number(name, &|v| match v {
                    RecordValues::Fundamentals { metrics } => metrics.get(name).copied().flatten(),
                    _ => None,
                }));
            }
        }
    }

    DataFrame::new(columns)
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), StorageError> {
    let parquet_err = |cause: String| StorageError::Parquet {
        path: path.to_path_buf(),
        cause,
    };
    let file = fs::File::create(path).map_err(|e| StorageError::Unreachable {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    ParquetWriter::new(file).finish(df).map_err(|e| {
        let _ = fs::remove_file(path);
        parquet_err(e.to_string())
    })?;
    Ok(())
}

/// Typed accessors over a loaded frame. Errors are plain strings; the caller
/// attaches the path.
struct Columns<'a> {
    df: &'a DataFrame,
}

impl<'a> Columns<'a> {
    fn str(&self, name: &str) -> Result<&'a StringChunked, String> {
        self.df
            .column(name)
            .and_then(|c| c.str())
            .map_err(|e| format!("column '{name}': {e}"))
    }

    fn f64(&self, name: &str) -> Result<&'a Float64Chunked, String> {
        self.df
            .column(name)
            .and_then(|c| c.f64())
            .map_err(|e| format!("column '{name}': {e}"))
    }

    fn millis(&self, name: &str) -> Result<Vec<Option<i64>>, String> {
        let col = self
            .df
            .column(name)
            .and_then(|c| c.cast(&DataType::Int64))
            .map_err(|e| format!("column '{name}': {e}"))?;
        let ca = col.i64().map_err(|e| format!("column '{name}': {e}"))?;
        Ok(ca.into_iter().collect())
    }
}

fn dataframe_to_records(
    df: &DataFrame,
    dataset_type: DatasetType,
) -> Result<Vec<NormalizedRecord>, String> {
    let cols = Columns { df };
    let entity = cols.str("entity_id")?;
    let timestamps = cols.millis("timestamp")?;
    let dataset_ids = cols.str("dataset_id")?;
    let frequencies = cols.str("frequency")?;
    let units = cols.str("unit")?;
    let sources = cols.str("source")?;
    let collected = cols.millis("collection_timestamp")?;
    let flags = cols.str("quality_flags")?;

    let to_utc = |ms: Option<i64>, row: usize, name: &str| -> Result<DateTime<Utc>, String> {
        ms.and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| format!("null or invalid {name} at row {row}"))
    };

    let mut values: Vec<RecordValues> = Vec::with_capacity(df.height());
    match dataset_type {
        DatasetType::Ohlcv => {
            let [open, high, low, close, volume, adj] = [
                cols.f64("open")?,
                cols.f64("high")?,
                cols.f64("low")?,
                cols.f64("close")?,
                cols.f64("volume")?,
                cols.f64("adj_close")?,
            ];
            for i in 0..df.height() {
                let req = |ca: &Float64Chunked, name: &str| {
                    ca.get(i).ok_or_else(|| format!("null {name} at row {i}"))
                };
                values.push(RecordValues::Ohlcv {
                    open: req(open, "open")?,
                    high: req(high, "high")?,
                    low: req(low, "low")?,
                    close: req(close, "close")?,
                    volume: req(volume, "volume")?,
                    adj_close: adj.get(i),
                });
            }
        }
        DatasetType::EconomicIndicator => {
            let value = cols.f64("value")?;
            for i in 0..df.height() {
                values.push(RecordValues::Economic {
                    value: value.get(i).ok_or_else(|| format!("null value at row {i}"))?,
                });
            }
        }
        DatasetType::Event => {
            let event_type = cols.str("event_type")?;
            let value = cols.f64("value")?;
            for i in 0..df.height() {
                values.push(RecordValues::Event {
                    event_type: event_type
                        .get(i)
                        .ok_or_else(|| format!("null event_type at row {i}"))?
                        .to_string(),
                    value: value.get(i),
                });
            }
        }
        DatasetType::Fundamentals => {
            let metric_names: Vec<String> = df
                .get_column_names()
                .into_iter()
                .map(|n| n.to_string())
                .filter(|n| !BASE_COLUMNS.contains(&n.as_str()))
                .collect();
            let metric_cols = metric_names
                .iter()
                .map(|n| cols.f64(n))
                .collect::<Result<Vec<_>, _>>()?;
            for i in 0..df.height() {
                let metrics = metric_names
                    .iter()
                    .zip(&metric_cols)
                    .map(|(n, ca)| (n.clone(), ca.get(i)))
                    .collect();
                values.push(RecordValues::Fundamentals { metrics });
            }
        }
    }

    let mut records = Vec::with_capacity(df.height());
    for (i, values) in values.into_iter().enumerate() {
        let frequency = frequencies
            .get(i)
            .and_then(|f| f.parse().ok())
            .unwrap_or(Frequency::Unknown);
        records.push(NormalizedRecord {
            entity_id: entity
                .get(i)
                .ok_or_else(|| format!("null entity_id at row {i}"))?
                .to_string(),
            timestamp: to_utc(timestamps[i], i, "timestamp")?,
            dataset_type,
            dataset_id: dataset_ids.get(i).unwrap_or_default().to_string(),
            frequency,
            values,
            unit: units.get(i).map(str::to_string),
            source: sources.get(i).unwrap_or_default().to_string(),
            collection_timestamp: to_utc(collected[i], i, "collection_timestamp")?,
            quality_flags: flags
                .get(i)
                .unwrap_or_default()
                .split(FLAG_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn store() -> (tempfile::TempDir, ParquetStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path().join("data"));
        (dir, store)
    }

    fn base(entity: &str, day: i64, values: RecordValues) -> NormalizedRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
        NormalizedRecord {
            entity_id: entity.into(),
            timestamp: ts,
            dataset_type: values.dataset_type(),
            dataset_id: "test_ds".into(),
            frequency: Frequency::Daily,
            values,
            unit: None,
            source: "test".into(),
            collection_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            quality_flags: vec![],
        }
    }

    fn bar(entity: &str, day: i64, close: f64) -> NormalizedRecord {
        base(
            entity,
            day,
            RecordValues::Ohlcv {
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000.0,
                adj_close: None,
            },
        )
    }

    #[test]
    fn partition_key_is_sanitized() {
        assert_eq!(partition_key("BHP.AX", DatasetType::Ohlcv), "BHP_AX_ohlcv");
        assert_eq!(
            partition_key("CPI/AU", DatasetType::EconomicIndicator),
            "CPI_AU_economic_indicator"
        );
    }

    #[test]
    fn path_depends_only_on_type_and_key() {
        let (_dir, store) = store();
        let p = store.partition_path(DatasetType::Ohlcv, "BHP_AX_ohlcv");
        assert!(p.ends_with("ohlcv/BHP_AX_ohlcv.parquet"));
    }

    #[test]
    fn write_and_load_ohlcv() {
        let (_dir, store) = store();
        let mut batch = vec![bar("BHP", 2, 12.0), bar("BHP", 0, 10.0), bar("BHP", 1, 11.0)];
        batch[0].quality_flags = vec!["zero_volume".into(), "missing_adj_close".into()];
        batch[1].unit = Some("AUD".into());

        let result = store.write(&batch, DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        assert_eq!(result.record_count, 3);
        assert!(!result.overwritten);
        assert!(result.path.exists());

        let loaded = store.load(DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        let closes: Vec<f64> = loaded
            .iter()
            .map(|r| match r.values {
                RecordValues::Ohlcv { close, .. } => close,
                _ => f64::NAN,
            })
            .collect();
        assert_eq!(closes, vec![10.0, 11.0, 12.0]);
        assert_eq!(loaded[0].unit.as_deref(), Some("AUD"));
        assert_eq!(loaded[2].quality_flags, batch[0].quality_flags);
        assert_eq!(loaded[2], batch[0]);
    }

    #[test]
    fn second_write_overwrites() {
        let (_dir, store) = store();
        store
            .write(&[bar("BHP", 0, 10.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap();
        let second = store
            .write(&[bar("BHP", 5, 20.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap();
        assert!(second.overwritten);
        let loaded = store.load(DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], bar("BHP", 5, 20.0));
    }

    #[test]
    fn duplicates_keep_last_occurrence() {
        let (_dir, store) = store();
        let batch = vec![bar("BHP", 0, 10.0), bar("BHP", 1, 11.0), bar("BHP", 0, 99.0)];
        let result = store.write(&batch, DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        assert_eq!(result.record_count, 2);
        let loaded = store.load(DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        assert_eq!(loaded[0], bar("BHP", 0, 99.0));
    }

    #[test]
    fn empty_batch_fails_with_path() {
        let (_dir, store) = store();
        let err = store.write(&[], DatasetType::Ohlcv, "BHP_ohlcv").unwrap_err();
        assert!(matches!(err, StorageError::EmptyBatch { .. }));
        assert!(err.path().ends_with("BHP_ohlcv.parquet"));
        assert!(!err.path().exists());
    }

    #[test]
    fn mismatched_dataset_type_is_rejected() {
        let (_dir, store) = store();
        let err = store
            .write(&[bar("BHP", 0, 10.0)], DatasetType::Event, "BHP_event")
            .unwrap_err();
        assert!(matches!(err, StorageError::DatasetMismatch { .. }));
    }

    #[test]
    fn unreachable_root_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let store = ParquetStore::new(blocker.join("nested"));
        assert!(matches!(
            store.check_root(),
            Err(StorageError::Unreachable { .. })
        ));
        let err = store
            .write(&[bar("BHP", 0, 10.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap_err();
        assert!(matches!(err, StorageError::Unreachable { .. }));
    }

    #[test]
    fn economic_event_and_fundamentals_roundtrip() {
        let (_dir, store) = store();

        let mut econ = base("UNRATE", 0, RecordValues::Economic { value: 3.9 });
        econ.unit = Some("percent".into());
        store
            .write(std::slice::from_ref(&econ), DatasetType::EconomicIndicator, "UNRATE_economic_indicator")
            .unwrap();
        assert_eq!(
            store
                .load(DatasetType::EconomicIndicator, "UNRATE_economic_indicator")
                .unwrap(),
            vec![econ]
        );

        let event = base(
            "AAPL",
            0,
            RecordValues::Event {
                event_type: "dividend".into(),
                value: None,
            },
        );
        store
            .write(std::slice::from_ref(&event), DatasetType::Event, "AAPL_event")
            .unwrap();
        assert_eq!(store.load(DatasetType::Event, "AAPL_event").unwrap(), vec![event]);

        let mut metrics = BTreeMap::new();
        metrics.insert("eps".to_string(), Some(1.5));
        metrics.insert("revenue".to_string(), None);
        let fundamentals = base("AAPL", 0, RecordValues::Fundamentals { metrics });
        store
            .write(std::slice::from_ref(&fundamentals), DatasetType::Fundamentals, "AAPL_fundamentals")
            .unwrap();
        assert_eq!(
            store.load(DatasetType::Fundamentals, "AAPL_fundamentals").unwrap(),
            vec![fundamentals]
        );
    }

    #[test]
    fn sidecar_and_status() {
        let (_dir, store) = store();
        store
            .write(&[bar("BHP", 0, 10.0), bar("BHP", 3, 11.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap();
        store
            .write(&[bar("CBA", 0, 10.0)], DatasetType::Ohlcv, "CBA_ohlcv")
            .unwrap();

        let meta = store.meta(DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.end - meta.start, Duration::days(3));
        assert_eq!(meta.data_hash.len(), 64);

        let status = store.status().unwrap();
        let keys: Vec<&str> = status.iter().map(|s| s.meta.partition_key.as_str()).collect();
        assert_eq!(keys, vec!["BHP_ohlcv", "CBA_ohlcv"]);
    }

    #[test]
    fn snapshots_accumulate_while_canonical_is_replaced() {
        let (_dir, store) = store();
        let store = store.with_snapshots(true);
        store
            .write(&[bar("BHP", 0, 10.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store
            .write(&[bar("BHP", 0, 11.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap();
        assert!(second.snapshot.unwrap().exists());
        assert_eq!(store.snapshots(DatasetType::Ohlcv, "BHP_ohlcv").len(), 2);
        assert_eq!(store.load(DatasetType::Ohlcv, "BHP_ohlcv").unwrap().len(), 1);
    }

    #[test]
    fn failed_snapshot_leaves_partition_untouched() {
        let (_dir, store) = store();
        let store = store.with_snapshots(true);
        store
            .write(&[bar("BHP", 0, 10.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap();
        let before = store.meta(DatasetType::Ohlcv, "BHP_ohlcv").unwrap();

        // A file where the snapshot directory should be.
        let snapshot_dir = store.snapshot_dir(DatasetType::Ohlcv, "BHP_ohlcv");
        fs::remove_dir_all(&snapshot_dir).unwrap();
        fs::write(&snapshot_dir, b"not a directory").unwrap();

        let err = store
            .write(&[bar("BHP", 5, 20.0), bar("BHP", 6, 21.0)], DatasetType::Ohlcv, "BHP_ohlcv")
            .unwrap_err();
        assert!(matches!(err, StorageError::Unreachable { .. }), "{err:?}");

        let loaded = store.load(DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        assert_eq!(loaded, vec![bar("BHP", 0, 10.0)]);
        let after = store.meta(DatasetType::Ohlcv, "BHP_ohlcv").unwrap();
        assert_eq!(after.data_hash, before.data_hash);
        assert_eq!(after.record_count, 1);

        let dataset_dir = store.dataset_dir(DatasetType::Ohlcv);
        let leftovers: Vec<_> = fs::read_dir(&dataset_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn load_missing_partition() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load(DatasetType::Ohlcv, "NOPE_ohlcv"),
            Err(StorageError::NotFound { .. })
        ));
    }
}
