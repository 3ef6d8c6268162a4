//! Durable table storage for the Replay pipeline.
//!
//! The persisted "enriched history" table is a header-having CSV file that is
//! only ever appended to. Resumability is derived from it: there is no
//! separate checkpoint file, callers re-read the table's row ids at startup
//! and subtract them from the working set.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use replay_core::StreamRecord;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "replay-store";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("no table found at {path}")]
    NotFound { path: PathBuf },
    #[error("table at {path} exists but holds no data")]
    Empty { path: PathBuf },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl TableError {
    /// `NotFound` and `Empty` both mean "start from an empty table" for
    /// every caller in the pipeline; only real I/O or format errors abort.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TableError::NotFound { .. } | TableError::Empty { .. })
    }
}

/// One CSV-backed table of [`StreamRecord`]s.
#[derive(Debug, Clone)]
pub struct StreamTable {
    path: PathBuf,
}

impl StreamTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole table. Fails with [`TableError::NotFound`] when the
    /// file does not exist and [`TableError::Empty`] when it exists but has
    /// no content, so callers can tell a fresh run from a truncated one.
    pub fn read_all(&self) -> Result<Vec<StreamRecord>, TableError> {
        if !self.path.exists() {
            return Err(TableError::NotFound {
                path: self.path.clone(),
            });
        }
        let file = File::open(&self.path).map_err(|source| TableError::Io {
            path: self.path.clone(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| TableError::Io {
                path: self.path.clone(),
                source,
            })?
            .len();
        if len == 0 {
            return Err(TableError::Empty {
                path: self.path.clone(),
            });
        }

        let mut reader = csv::Reader::from_reader(file);
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            let record: StreamRecord = row.map_err(|source| TableError::Csv {
                path: self.path.clone(),
                source,
            })?;
            rows.push(record);
        }
        debug!(rows = rows.len(), path = %self.path.display(), "read table");
        Ok(rows)
    }

    /// Like [`read_all`](Self::read_all), but a missing or empty table reads
    /// as zero rows. For stages that treat "nothing persisted yet" as a
    /// normal starting state.
    pub fn read_or_empty(&self) -> Result<Vec<StreamRecord>, TableError> {
        match self.read_all() {
            Ok(rows) => Ok(rows),
            Err(err) if err.is_recoverable() => {
                debug!(path = %self.path.display(), %err, "reading absent table as empty");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Appends rows, writing the header only when the file does not exist
    /// yet. Column order is fixed by the record type, so appended rows always
    /// match the established header.
    pub fn append_rows(&self, rows: &[StreamRecord]) -> Result<usize, TableError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| TableError::Io {
                path: self.path.clone(),
                source,
            })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        for row in rows {
            writer.serialize(row).map_err(|source| TableError::Csv {
                path: self.path.clone(),
                source,
            })?;
        }
        writer.flush().map_err(|source| TableError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            rows = rows.len(),
            header = write_header,
            path = %self.path.display(),
            "appended rows"
        );
        Ok(rows.len())
    }

    /// Replaces the table wholesale (stage outputs that are rebuilt on every
    /// run, unlike the append-only enriched table).
    pub fn write_all(&self, rows: &[StreamRecord]) -> Result<usize, TableError> {
        let mut writer = csv::Writer::from_path(&self.path).map_err(|source| TableError::Csv {
            path: self.path.clone(),
            source,
        })?;
        for row in rows {
            writer.serialize(row).map_err(|source| TableError::Csv {
                path: self.path.clone(),
                source,
            })?;
        }
        writer.flush().map_err(|source| TableError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(rows.len())
    }

    /// Physical line count including the header, zero for a missing file.
    /// Used only to report progress deltas, never for logic.
    pub fn count_lines(&self) -> Result<usize, TableError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let file = File::open(&self.path).map_err(|source| TableError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(BufReader::new(file).lines().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn record(id: &str) -> StreamRecord {
        StreamRecord {
            id: id.to_string(),
            end_time: Utc.with_ymd_and_hms(2024, 3, 1, 18, 30, 0).single().unwrap(),
            artist_name: "Nick Drake".into(),
            track_name: "Pink Moon".into(),
            album_name: Some("Pink Moon".into()),
            ms_played: 122_000,
            min_played: 122.0 / 60.0,
            track_src_id: "Nick Drake:Pink Moon".into(),
            track_uri: Some("6e4CKf1nCbNU5NvXhUa5gf".into()),
            username: None,
            platform: Some("android os".into()),
            conn_country: Some("FR".into()),
            ip_addr: None,
            user_agent: None,
            reason_start: Some("trackdone".into()),
            reason_end: Some("trackdone".into()),
            shuffle: Some(false),
            skipped: Some(false),
            offline: Some(false),
            offline_timestamp: None,
            incognito_mode: Some(false),
            in_library: None,
            artist_uri: None,
            album_uri: None,
            track_duration_ms: None,
            track_popularity: None,
            percentage_played: None,
            danceability: None,
            energy: None,
            key: None,
            loudness: None,
            mode: None,
            speechiness: None,
            acousticness: None,
            instrumentalness: None,
            liveness: None,
            valence: None,
            tempo: None,
            time_signature: None,
            year: None,
            month: None,
            month_name: None,
            day: None,
            day_of_week: None,
            day_name: None,
            hour: None,
            minute: None,
            is_new_track: None,
            is_new_artist: None,
            is_new_album: None,
            normalized_platform: None,
        }
    }

    #[test]
    fn missing_table_reads_as_not_found() {
        let dir = tempdir().expect("tempdir");
        let table = StreamTable::new(dir.path().join("absent.csv"));
        let err = table.read_all().unwrap_err();
        assert!(matches!(err, TableError::NotFound { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn zero_byte_table_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, b"").expect("touch");
        let err = StreamTable::new(&path).read_all().unwrap_err();
        assert!(matches!(err, TableError::Empty { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn read_or_empty_recovers_missing_and_zero_byte_tables() {
        let dir = tempdir().expect("tempdir");
        let table = StreamTable::new(dir.path().join("absent.csv"));
        assert!(table.read_or_empty().expect("missing").is_empty());

        let path = dir.path().join("empty.csv");
        std::fs::write(&path, b"").expect("touch");
        assert!(StreamTable::new(&path).read_or_empty().expect("empty").is_empty());
    }

    #[test]
    fn append_writes_header_exactly_once() {
        let dir = tempdir().expect("tempdir");
        let table = StreamTable::new(dir.path().join("history.csv"));

        table.append_rows(&[record("a")]).expect("first append");
        table
            .append_rows(&[record("b"), record("c")])
            .expect("second append");

        let text = std::fs::read_to_string(table.path()).expect("read");
        let header_lines = text.lines().filter(|l| l.starts_with("id,")).count();
        assert_eq!(header_lines, 1);

        let rows = table.read_all().expect("read back");
        assert_eq!(
            rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn appending_nothing_does_not_create_the_file() {
        let dir = tempdir().expect("tempdir");
        let table = StreamTable::new(dir.path().join("history.csv"));
        assert_eq!(table.append_rows(&[]).expect("append"), 0);
        assert!(!table.path().exists());
    }

    #[test]
    fn count_lines_includes_header_and_is_zero_for_missing() {
        let dir = tempdir().expect("tempdir");
        let table = StreamTable::new(dir.path().join("history.csv"));
        assert_eq!(table.count_lines().expect("count"), 0);
        table.append_rows(&[record("a"), record("b")]).expect("append");
        assert_eq!(table.count_lines().expect("count"), 3);
    }

    #[test]
    fn optional_columns_survive_a_round_trip() {
        let dir = tempdir().expect("tempdir");
        let table = StreamTable::new(dir.path().join("history.csv"));
        let mut row = record("a");
        row.track_uri = None;
        row.track_popularity = Some(63);
        row.percentage_played = Some(97.12);
        table.write_all(&[row.clone()]).expect("write");
        let rows = table.read_all().expect("read");
        assert_eq!(rows, vec![row]);
    }
}
