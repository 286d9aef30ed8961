use crate::models::ProgressStatus;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// One parsed progress line. Each variant owns a disjoint set of fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Overall {
        percentage: f64,
        downloaded_objects: u64,
        total_objects: u64,
        runtime: String,
        eta: String,
    },
    Volume {
        downloaded_mib: f64,
        written_mib: f64,
    },
    Cache {
        usage_mib: f64,
        active_tasks: u64,
    },
    Download {
        raw_mibps: f64,
        decompressed_mibps: f64,
    },
    Disk {
        write_mibps: f64,
        read_mibps: f64,
    },
}

impl ProgressUpdate {
    pub fn apply(&self, status: &mut ProgressStatus) {
        match self {
            Self::Overall {
                percentage,
                downloaded_objects,
                total_objects,
                runtime,
                eta,
            } => {
                status.percentage = *percentage;
                status.downloaded_objects = *downloaded_objects;
                status.total_objects = *total_objects;
                status.runtime = runtime.clone();
                status.eta = eta.clone();
            }
            Self::Volume {
                downloaded_mib,
                written_mib,
            } => {
                status.downloaded_mib = *downloaded_mib;
                status.written_mib = *written_mib;
            }
            Self::Cache {
                usage_mib,
                active_tasks,
            } => {
                status.cache_usage_mib = *usage_mib;
                status.active_tasks = *active_tasks;
            }
            Self::Download {
                raw_mibps,
                decompressed_mibps,
            } => {
                status.download_raw_mibps = *raw_mibps;
                status.download_decompressed_mibps = *decompressed_mibps;
            }
            Self::Disk {
                write_mibps,
                read_mibps,
            } => {
                status.disk_write_mibps = *write_mibps;
                status.disk_read_mibps = *read_mibps;
            }
        }
    }
}

/// Write side of one invocation's progress record.
///
/// Not `Clone`: whoever holds the tracker is the record's only writer.
/// Readers subscribe and always observe whole snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    sender: Arc<watch::Sender<ProgressStatus>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ProgressStatus::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn apply(&self, update: &ProgressUpdate) {
        self.sender.send_modify(|status| update.apply(status));
    }

    pub fn set_in_progress(&self, in_progress: bool) {
        self.sender.send_if_modified(|status| {
            if status.in_progress == in_progress {
                return false;
            }
            status.in_progress = in_progress;
            true
        });
    }

    pub fn snapshot(&self) -> ProgressStatus {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressStatus> {
        self.sender.subscribe()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-invocation-id view of the most recent progress record.
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    records: Arc<Mutex<HashMap<String, Arc<watch::Sender<ProgressStatus>>>>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh record for `id`, replacing any earlier one.
    pub fn open(&self, id: &str) -> ProgressTracker {
        let tracker = ProgressTracker::new();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tracker.sender.clone());
        tracker
    }

    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<ProgressStatus>> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|sender| sender.subscribe())
    }

    pub fn snapshot(&self, id: &str) -> Option<ProgressStatus> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|sender| sender.borrow().clone())
    }

    /// Drops the record for `id` once its tracker is gone. A record still
    /// being written by a running invocation is kept. Returns whether the
    /// record was removed.
    pub fn forget(&self, id: &str) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get(id) {
            Some(sender) if Arc::strong_count(sender) == 1 => {
                records.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
