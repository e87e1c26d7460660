//! Raw correction-stream capture files
//!
//! One append-mode binary file per active correction channel, flushed after
//! every write so a crash loses at most the in-flight buffer. A write failure
//! disables that log and the pipeline keeps running; capture is never worth a
//! correction outage.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct RawLog {
    path: PathBuf,
    // None after a write failure
    file: Option<File>,
}

impl RawLog {
    /// Open (creating or appending) a capture file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening raw log {}", path.display()))?;
        info!("raw stream capture enabled: {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Append one buffer and flush. Failures disable this log permanently.
    pub fn write(&mut self, data: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = file.write_all(data).and_then(|()| file.flush());
        if let Err(e) = result {
            warn!(
                "raw log {} disabled after write failure: {e}",
                self.path.display()
            );
            self.file = None;
        } else {
            metrics::counter!("raw_log.bytes_total").increment(data.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture_ip.bin");

        let mut log = RawLog::open(&path).unwrap();
        log.write(&[1, 2, 3]);
        log.write(&[4, 5]);
        drop(log);

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4, 5]);

        // Re-opening appends rather than truncating
        let mut log = RawLog::open(&path).unwrap();
        log.write(&[6]);
        drop(log);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn open_fails_on_unwritable_path() {
        assert!(RawLog::open("/nonexistent-dir/capture.bin").is_err());
    }
}
