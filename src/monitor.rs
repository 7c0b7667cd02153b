//! Config file change monitoring.
//!
//! The monitor polls the file's metadata on a fixed interval and publishes a
//! freshly parsed snapshot whenever the modification time or size changes.
//! Half-written or otherwise invalid content is skipped with a warning; the
//! previously published snapshot stays in effect.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::FileConfig;
use crate::error::Result;

/// How often the config file's metadata is checked for changes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Files smaller than this cannot hold a valid config and are skipped.
const MIN_FILE_BYTES: u64 = 10;

/// Buffered config snapshots between the monitor and its consumer.
const CHANGE_BUFFER: usize = 10;

/// Read `path` immediately and start a background task that re-reads it on
/// change, publishing each parsed snapshot on the returned channel.
///
/// A missing or unparsable file at startup is an error; after that the
/// monitor only warns and keeps going. The task exits when the receiver is
/// dropped.
pub fn spawn_file_monitor(
    path: PathBuf,
    poll_interval: Duration,
) -> Result<(FileConfig, mpsc::Receiver<Arc<FileConfig>>)> {
    let init = FileConfig::from_file(&path)?;
    let mut last_seen = Fingerprint::of(&path);

    let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
    tokio::spawn(async move {
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let current = Fingerprint::of(&path);
            if current == last_seen {
                continue;
            }
            last_seen = current;

            let Some(fingerprint) = &last_seen else {
                warn!(path = %path.display(), "Config file is no longer readable");
                continue;
            };
            if fingerprint.len < MIN_FILE_BYTES {
                warn!(path = %path.display(), "Config file is too small to be valid, skipping");
                continue;
            }

            match FileConfig::from_file(&path) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        rules = config.keys.len(),
                        "Config file changed, publishing update"
                    );
                    if tx.send(Arc::new(config)).await.is_err() {
                        // Consumer is gone; stop watching.
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to parse changed config file, keeping the previous one"
                    );
                }
            }
        }
    });

    Ok((init, rx))
}

/// Cheap change detector for the watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    modified: SystemTime,
    len: u64,
}

impl Fingerprint {
    fn of(path: &PathBuf) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        let modified = meta.modified().ok()?;
        Some(Self {
            modified,
            len: meta.len(),
        })
    }
}
