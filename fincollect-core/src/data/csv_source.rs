//! CSV drop-directory source: one `{entity}.csv` file per entity.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::source::{DateRange, FetchError, SourceClient};
use crate::domain::{FieldValue, RawRecord};
use crate::schema::parse_timestamp;

pub struct CsvSource {
    name: String,
    dir: PathBuf,
    date_column: Option<String>,
    requests_per_minute: Option<u32>,
}

impl CsvSource {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            date_column: None,
            requests_per_minute: None,
        }
    }

    /// Keep only rows whose `column` falls inside the requested range.
    /// Rows with an unparsable date are kept so validation can report them.
    pub fn with_date_filter(mut self, column: impl Into<String>) -> Self {
        self.date_column = Some(column.into());
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `BHP.AX` is looked up as `BHP.AX.csv`, then `BHP_AX.csv`.
    fn entity_path(&self, entity_id: &str) -> Option<PathBuf> {
        let exact = self.dir.join(format!("{entity_id}.csv"));
        if exact.is_file() {
            return Some(exact);
        }
        let underscored = self
            .dir
            .join(format!("{}.csv", entity_id.replace(['.', '/'], "_")));
        underscored.is_file().then_some(underscored)
    }
}

impl SourceClient for CsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, entity_id: &str, range: &DateRange) -> Result<Vec<RawRecord>, FetchError> {
        let path = self
            .entity_path(entity_id)
            .ok_or_else(|| FetchError::EntityNotFound {
                entity: entity_id.to_string(),
            })?;

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(false)
            .from_path(&path)
            .map_err(|e| FetchError::Other(format!("{}: {e}", path.display())))?;
        let headers = reader
            .headers()
            .map_err(|e| FetchError::ResponseFormatChanged(format!("{}: {e}", path.display())))?
            .clone();

        let fetched_at = Utc::now();
        let mut records = Vec::new();
        let mut skipped = 0usize;
        for row in reader.records() {
            let row = row.map_err(|e| {
                FetchError::ResponseFormatChanged(format!("{}: {e}", path.display()))
            })?;
            let mut record = RawRecord::new(self.name.as_str(), fetched_at);
            for (header, cell) in headers.iter().zip(row.iter()) {
                record
                    .fields
                    .insert(header.to_string(), FieldValue::from_text(cell));
            }

            if let Some(column) = &self.date_column {
                let date = record
                    .get(column)
                    .and_then(FieldValue::as_text)
                    .and_then(parse_timestamp);
                if let Some(ts) = date {
                    if !range.contains(ts.date_naive()) {
                        skipped += 1;
                        continue;
                    }
                }
            }
            records.push(record);
        }

        debug!(
            source = %self.name,
            entity = entity_id,
            rows = records.len(),
            skipped,
            "read csv"
        );

        if records.is_empty() {
            return Err(FetchError::NoData {
                entity: entity_id.to_string(),
            });
        }
        Ok(records)
    }

    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }

    fn requests_per_minute(&self) -> Option<u32> {
        self.requests_per_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
    }

    fn write_csv(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn reads_rows_as_text_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "BHP_AX.csv",
            "Date,Open,Volume\n2024-01-02, 10.5 ,1000\n2024-01-03,NA,1200\n",
        );
        let source = CsvSource::new("asx_csv", dir.path());
        let records = source.fetch("BHP.AX", &range()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source(), "asx_csv");
        assert_eq!(records[0].get("Open"), Some(&FieldValue::Text("10.5".into())));
        assert!(records[1].get("Open").unwrap().is_null());
    }

    #[test]
    fn missing_file_is_entity_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvSource::new("csv", dir.path())
            .fetch("NOPE", &range())
            .unwrap_err();
        assert_eq!(err, FetchError::EntityNotFound { entity: "NOPE".into() });
        assert!(!err.is_transient());
    }

    #[test]
    fn date_filter_limits_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "CBA.csv",
            "date,close\n2023-12-29,1\n2024-01-02,2\nsomeday,3\n",
        );
        let source = CsvSource::new("csv", dir.path()).with_date_filter("date");
        let records = source.fetch("CBA", &range()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn header_only_file_has_no_data() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "X.csv", "date,close\n");
        assert!(matches!(
            CsvSource::new("csv", dir.path()).fetch("X", &range()),
            Err(FetchError::NoData { .. })
        ));
    }

    #[test]
    fn ragged_rows_are_a_format_change() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "X.csv", "date,close\n2024-01-02,1,extra\n");
        assert!(matches!(
            CsvSource::new("csv", dir.path()).fetch("X", &range()),
            Err(FetchError::ResponseFormatChanged(_))
        ));
    }

    #[test]
    fn availability_follows_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CsvSource::new("csv", dir.path()).is_available());
        assert!(!CsvSource::new("csv", dir.path().join("missing")).is_available());
    }
}
