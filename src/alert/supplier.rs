//! Alert suppliers: finite, single-pass, lazily produced alert sequences

use super::RawAlert;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

pub trait AlertSupplier: Iterator<Item = RawAlert> + Send {
    fn name(&self) -> &str;

    /// Input that could not be read at all, so far
    fn read_errors(&self) -> u64 {
        0
    }
}

/// In-memory supplier
pub struct VecAlertSupplier {
    name: String,
    alerts: std::vec::IntoIter<RawAlert>,
}

impl VecAlertSupplier {
    pub fn new(name: impl Into<String>, alerts: Vec<RawAlert>) -> Self {
        Self {
            name: name.into(),
            alerts: alerts.into_iter(),
        }
    }
}

impl Iterator for VecAlertSupplier {
    type Item = RawAlert;

    fn next(&mut self) -> Option<RawAlert> {
        self.alerts.next()
    }
}

impl AlertSupplier for VecAlertSupplier {
    fn name(&self) -> &str {
        &self.name
    }
}

/// One `RawAlert` JSON document per line; malformed lines are logged and skipped
///
/// Lines that are not valid UTF-8 are skipped and counted as read errors.
/// Any other I/O error is counted and ends the stream.
pub struct JsonlAlertSupplier {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    skipped: usize,
    read_errors: u64,
}

impl JsonlAlertSupplier {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        log::info!("📂 Reading alerts from {}", path.display());

        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
            skipped: 0,
            read_errors: 0,
        })
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for JsonlAlertSupplier {
    type Item = RawAlert;

    fn next(&mut self) -> Option<RawAlert> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.read_errors += 1;
                    log::error!("❌ Read error in {}:{}: {}", self.path.display(), self.line_no, e);
                    if e.kind() == std::io::ErrorKind::InvalidData {
                        continue;
                    }
                    return None;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<RawAlert>(&line) {
                Ok(alert) => return Some(alert),
                Err(e) => {
                    self.skipped += 1;
                    log::warn!(
                        "⚠️  Skipping malformed alert at {}:{}: {}",
                        self.path.display(),
                        self.line_no,
                        e
                    );
                }
            }
        }
    }
}

impl AlertSupplier for JsonlAlertSupplier {
    fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("jsonl")
    }

    fn read_errors(&self) -> u64 {
        self.read_errors
    }
}

/// Passes through only the listed alert ids
pub struct FilteringAlertSupplier<S> {
    inner: S,
    match_ids: HashSet<u64>,
    name: String,
}

impl<S: AlertSupplier> FilteringAlertSupplier<S> {
    pub fn new(inner: S, match_ids: impl IntoIterator<Item = u64>) -> Self {
        let name = format!("{}[filtered]", inner.name());
        Self {
            inner,
            match_ids: match_ids.into_iter().collect(),
            name,
        }
    }
}

impl<S: AlertSupplier> Iterator for FilteringAlertSupplier<S> {
    type Item = RawAlert;

    fn next(&mut self) -> Option<RawAlert> {
        let match_ids = &self.match_ids;
        self.inner.find(|alert| match_ids.contains(&alert.alert_id))
    }
}

impl<S: AlertSupplier> AlertSupplier for FilteringAlertSupplier<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_errors(&self) -> u64 {
        self.inner.read_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::test_support::raw_alert;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_jsonl_skips_malformed_lines() {
        let mut file = NamedTempFile::new().unwrap();
        let good = serde_json::to_string(&raw_alert(1, "X123", vec![])).unwrap();
        writeln!(file, "{}", good).unwrap();
        writeln!(file, "{{not json").unwrap();
        writeln!(file).unwrap();
        let second = serde_json::to_string(&raw_alert(2, "Y9", vec![])).unwrap();
        writeln!(file, "{}", second).unwrap();
        file.flush().unwrap();

        let mut supplier = JsonlAlertSupplier::open(file.path()).unwrap();
        let ids: Vec<u64> = supplier.by_ref().map(|a| a.alert_id).collect();

        assert_eq!(ids, vec![1, 2]);
        assert_eq!(supplier.skipped(), 1);
        assert_eq!(supplier.read_errors(), 0);
    }

    #[test]
    fn test_jsonl_counts_unreadable_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", serde_json::to_string(&raw_alert(1, "X123", vec![])).unwrap()).unwrap();
        file.write_all(&[0xff, 0xfe, 0x00, b'\n']).unwrap();
        writeln!(file, "{}", serde_json::to_string(&raw_alert(2, "Y9", vec![])).unwrap()).unwrap();
        file.flush().unwrap();

        let mut supplier = FilteringAlertSupplier::new(JsonlAlertSupplier::open(file.path()).unwrap(), [1, 2]);
        let ids: Vec<u64> = supplier.by_ref().map(|a| a.alert_id).collect();

        assert_eq!(ids, vec![1, 2]);
        assert_eq!(supplier.read_errors(), 1);
    }

    #[test]
    fn test_filtering_supplier() {
        let alerts = (1..=5).map(|i| raw_alert(i, "X123", vec![])).collect();
        let supplier = FilteringAlertSupplier::new(VecAlertSupplier::new("vec", alerts), [2, 4]);

        assert_eq!(supplier.name(), "vec[filtered]");
        let ids: Vec<u64> = supplier.map(|a| a.alert_id).collect();
        assert_eq!(ids, vec![2, 4]);
    }
}
