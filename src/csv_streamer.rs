//! Mirrors acquisition ticks to a CSV log file.
//!
//! One row per tick: the timestamp followed by the series values in
//! header order, missing values left blank. Not internally thread-safe;
//! the owning data handler calls it from its worker thread only. A
//! write error disables logging for the rest of the session instead of
//! stopping the acquisition.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use log::error;

#[derive(Default)]
pub struct CsvStreamer {
    writer: Option<csv::Writer<File>>,
    header: Vec<String>,
}

impl CsvStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `path` for writing, replacing any existing content.
    /// Returns `false` (and disables logging) when the file cannot be
    /// created.
    pub fn prepare_file(&mut self, path: &Path) -> bool {
        // the log format is LF-terminated; the csv default is CRLF
        let writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_path(path);
        match writer {
            Ok(writer) => {
                self.writer = Some(writer);
                true
            }
            Err(e) => {
                error!("cannot create log file {}: {}", path.display(), e);
                self.writer = None;
                false
            }
        }
    }

    /// Writes the header row: `time` followed by the series names in
    /// insertion order.
    pub fn create_header(&mut self, names: &[String]) {
        self.header = names.to_vec();

        if let Some(writer) = self.writer.as_mut() {
            let record = std::iter::once("time").chain(names.iter().map(String::as_str));
            if let Err(e) = writer.write_record(record) {
                error!("log header write failed: {}", e);
                self.writer = None;
            }
        }
    }

    /// Appends one data row. Values absent from `values` are emitted as
    /// empty fields.
    pub fn write_line(&mut self, time: f64, values: &HashMap<String, f64>) {
        if let Some(writer) = self.writer.as_mut() {
            let record = std::iter::once(time.to_string()).chain(
                self.header
                    .iter()
                    .map(|name| values.get(name).map(|v| v.to_string()).unwrap_or_default()),
            );
            if let Err(e) = writer.write_record(record) {
                error!("log row write failed; logging disabled: {}", e);
                self.writer = None;
            }
        }
    }

    /// Flushes and closes the log file.
    pub fn finish_logging(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                error!("log flush failed: {}", e);
            }
        }
        self.header.clear();
    }

    pub fn is_active(&self) -> bool {
        self.writer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_match_ticks_and_header_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");

        let mut streamer = CsvStreamer::new();
        assert!(streamer.prepare_file(&path));
        streamer.create_header(&["b".to_string(), "a".to_string()]);

        let mut values = HashMap::new();
        values.insert("a".to_string(), 1.5);
        values.insert("b".to_string(), 2.0);
        streamer.write_line(0.1, &values);

        // second tick misses `a`
        values.remove("a");
        streamer.write_line(0.2, &values);
        streamer.finish_logging();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains('\r'), "rows must be LF-terminated");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, ["time,b,a", "0.1,2,1.5", "0.2,2,"]);
    }

    #[test]
    fn prepare_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(&path, "stale content\n").unwrap();

        let mut streamer = CsvStreamer::new();
        assert!(streamer.prepare_file(&path));
        streamer.create_header(&["x".to_string()]);
        streamer.finish_logging();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "time,x\n");
    }

    #[test]
    fn unwritable_path_disables_logging() {
        let mut streamer = CsvStreamer::new();
        assert!(!streamer.prepare_file(Path::new("/nonexistent/dir/log.csv")));
        assert!(!streamer.is_active());

        // writes become no-ops instead of failing the session
        streamer.create_header(&["x".to_string()]);
        streamer.write_line(0.0, &HashMap::new());
        streamer.finish_logging();
    }
}
