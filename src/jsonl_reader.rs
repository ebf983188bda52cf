//! JSONL step reader — parses a recorded step log back into StepRecords.
//!
//! Reads the header line (format, version) then yields records one at a
//! time. Works with any `BufRead`: files, in-memory buffers, stdin.

use crate::types::StepRecord;
use std::io::BufRead;

pub const STEP_LOG_FORMAT: &str = "genie-fall-steps";
pub const STEP_LOG_VERSION: u64 = 1;

/// Parsed JSONL header (first line of a step log).
#[derive(Debug)]
pub struct StepLogHeader {
    pub format: String,
    pub version: u64,
}

/// Line-by-line JSONL step reader.
pub struct StepReader<R: BufRead> {
    reader: R,
    pub header: StepLogHeader,
    line_buf: String,
}

impl<R: BufRead> StepReader<R> {
    /// Read and validate the header line. Returns an error if the header
    /// is missing, unparseable, or lacks a `"format": "genie-fall-steps"` field.
    pub fn open(mut reader: R) -> Result<Self, String> {
        let mut first_line = String::new();
        reader
            .read_line(&mut first_line)
            .map_err(|e| format!("read header: {}", e))?;

        let first_line = first_line.trim();
        if first_line.is_empty() {
            return Err("empty file".into());
        }

        let raw: serde_json::Value =
            serde_json::from_str(first_line).map_err(|e| format!("parse header: {}", e))?;

        let format = raw["format"]
            .as_str()
            .ok_or("missing \"format\" field")?
            .to_string();
        if format != STEP_LOG_FORMAT {
            return Err(format!("unknown format: {}", format));
        }
        let version = raw["version"].as_u64().unwrap_or(STEP_LOG_VERSION);
        if version > STEP_LOG_VERSION {
            return Err(format!("unsupported version: {}", version));
        }

        Ok(Self {
            reader,
            header: StepLogHeader {
                format,
                version,
            },
            line_buf: String::new(),
        })
    }

    /// Read the next record. Returns `None` at EOF, `Err` for unparseable lines.
    pub fn next_record(&mut self) -> Option<Result<StepRecord, String>> {
        loop {
            self.line_buf.clear();
            match self.reader.read_line(&mut self.line_buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = self.line_buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(
                        serde_json::from_str::<StepRecord>(trimmed)
                            .map_err(|e| format!("parse record: {}", e)),
                    );
                }
                Err(e) => return Some(Err(format!("read line: {}", e))),
            }
        }
    }

    /// Read all remaining records, skipping malformed lines.
    pub fn read_all(mut self) -> Vec<StepRecord> {
        let mut records = Vec::new();
        while let Some(result) = self.next_record() {
            if let Ok(record) = result {
                records.push(record);
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vector3;
    use std::io::Cursor;

    fn header() -> String {
        format!(r#"{{"format":"{}","version":1}}"#, STEP_LOG_FORMAT)
    }

    fn record(time: u64, note: i32) -> String {
        serde_json::to_string(&StepRecord {
            position: Vector3::new(1.0, -12.0, 0.5),
            note,
            time,
            bounce: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_open_valid_header() {
        let reader = StepReader::open(Cursor::new(header() + "\n")).unwrap();
        assert_eq!(reader.header.format, STEP_LOG_FORMAT);
        assert_eq!(reader.header.version, 1);
    }

    #[test]
    fn test_open_missing_format() {
        let err = StepReader::open(Cursor::new("{\"version\":1}\n")).err().unwrap();
        assert!(err.contains("format"), "got: {}", err);
    }

    #[test]
    fn test_open_wrong_format() {
        let err = StepReader::open(Cursor::new("{\"format\":\"steps\"}\n")).err().unwrap();
        assert!(err.contains("unknown format"), "got: {}", err);
    }

    #[test]
    fn test_open_future_version() {
        let data = format!(r#"{{"format":"{}","version":9}}"#, STEP_LOG_FORMAT) + "\n";
        let err = StepReader::open(Cursor::new(data)).err().unwrap();
        assert!(err.contains("version"), "got: {}", err);
    }

    #[test]
    fn test_open_empty_file() {
        assert!(StepReader::open(Cursor::new("")).is_err());
    }

    #[test]
    fn test_read_records_in_order() {
        let data = [header(), record(1000, 81), String::new(), record(2000, 93)].join("\n") + "\n";
        let records = StepReader::open(Cursor::new(data)).unwrap().read_all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time, 1000);
        assert_eq!(records[0].note, 81);
        assert_eq!(records[1].time, 2000);
        assert_eq!(records[1].position, Vector3::new(1.0, -12.0, 0.5));
    }

    #[test]
    fn test_read_all_skips_malformed() {
        let data = [header(), record(1000, 81), "not json".into(), record(3000, 84)].join("\n");
        let records = StepReader::open(Cursor::new(data)).unwrap().read_all();
        assert_eq!(records.len(), 2, "should skip garbled line");
        assert_eq!(records[1].time, 3000);
    }

    #[test]
    fn test_next_record_reports_error() {
        let data = header() + "\ngarbage\n";
        let mut reader = StepReader::open(Cursor::new(data)).unwrap();
        assert!(reader.next_record().unwrap().is_err());
        assert!(reader.next_record().is_none());
    }
}
