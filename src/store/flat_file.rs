use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{Event, HistoryRecord, RetentionReport, RowCounts, Sink, StoreError, newest_first};

const SAMPLES_FILE: &str = "process_snapshots.jsonl";
const EVENTS_FILE: &str = "events.jsonl";

/// Append-only JSON-lines sink: one file per record kind, linear scans on read.
pub struct FlatFileSink {
    dir: PathBuf,
}

impl FlatFileSink {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        for name in [SAMPLES_FILE, EVENTS_FILE] {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))?;
        }
        Ok(FlatFileSink {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn samples_path(&self) -> PathBuf {
        self.dir.join(SAMPLES_FILE)
    }

    fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }
}

/// True when the file is non-empty and its last byte is not a newline, i.e.
/// a previous write was cut short.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Serialize every row into one buffer and write it with a single call, so
/// a reader never sees part of a batch's line. A torn tail left by a crash
/// is terminated first so the batch starts on its own line.
fn append_lines<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let mut buf = Vec::new();
    if ends_mid_line(&mut file)? {
        warn!(path = %path.display(), "terminating torn trailing row");
        buf.push(b'\n');
    }
    for row in rows {
        serde_json::to_writer(&mut buf, row)?;
        buf.push(b'\n');
    }
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}

/// Every parseable row in file order. A trailing line cut short by a crash
/// is skipped with a warning.
fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut rows = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(row) => rows.push(row),
            Err(err) => warn!(path = %path.display(), line = lineno + 1, %err, "skipping unreadable row"),
        }
    }
    Ok(rows)
}

fn rewrite<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), StoreError> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for row in rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Returns (expired, trimmed) counts after rewriting `path` in place.
fn retain_recent<T>(
    path: &Path,
    cutoff: f64,
    max_rows: usize,
    timestamp: impl Fn(&T) -> f64 + Copy,
) -> Result<(usize, usize), StoreError>
where
    T: Serialize + DeserializeOwned,
{
    let mut rows: Vec<T> = read_lines(path)?;
    let before = rows.len();
    rows.retain(|row| timestamp(row) >= cutoff);
    let expired = before - rows.len();

    let mut trimmed = 0;
    if rows.len() > max_rows {
        rows.reverse();
        newest_first(&mut rows, timestamp);
        trimmed = rows.len() - max_rows;
        rows.truncate(max_rows);
        rows.reverse();
    }
    if expired > 0 || trimmed > 0 {
        rewrite(path, &rows)?;
    }
    Ok((expired, trimmed))
}

impl Sink for FlatFileSink {
    fn name(&self) -> &'static str {
        "flat-file"
    }

    fn append_samples(&mut self, rows: &[HistoryRecord]) -> Result<(), StoreError> {
        append_lines(&self.samples_path(), rows)
    }

    fn append_event(&mut self, event: &Event) -> Result<(), StoreError> {
        append_lines(&self.events_path(), std::slice::from_ref(event))
    }

    fn history(&mut self, pid: u32, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let mut rows: Vec<HistoryRecord> = read_lines(&self.samples_path())?;
        rows.retain(|r| r.pid == pid);
        // Later lines win ties on timestamp.
        rows.reverse();
        newest_first(&mut rows, |r| r.timestamp);
        rows.truncate(limit);
        Ok(rows)
    }

    fn events(&mut self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let mut rows: Vec<Event> = read_lines(&self.events_path())?;
        rows.reverse();
        newest_first(&mut rows, |e| e.timestamp);
        rows.truncate(limit);
        Ok(rows)
    }

    fn enforce_retention(
        &mut self,
        cutoff: f64,
        max_rows: usize,
    ) -> Result<RetentionReport, StoreError> {
        let (expired_samples, trimmed_samples) =
            retain_recent::<HistoryRecord>(&self.samples_path(), cutoff, max_rows, |r| r.timestamp)?;
        let (expired_events, trimmed_events) =
            retain_recent::<Event>(&self.events_path(), cutoff, max_rows, |e| e.timestamp)?;
        Ok(RetentionReport {
            expired_samples,
            expired_events,
            trimmed_samples,
            trimmed_events,
        })
    }

    fn row_counts(&mut self) -> Result<RowCounts, StoreError> {
        Ok(RowCounts {
            samples: read_lines::<HistoryRecord>(&self.samples_path())?.len(),
            events: read_lines::<Event>(&self.events_path())?.len(),
        })
    }
}
