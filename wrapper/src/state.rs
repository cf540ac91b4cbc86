//! In-memory job state plus its durable, atomically-replaced JSON file.
//!
//! All mutation goes through the supervise loop, which owns the store
//! exclusively; there is no locking because there is no second writer.
//! Persistence builds the complete document in memory, writes it to a
//! temporary file in the same directory and renames it over the
//! canonical path, so external pollers always parse a whole document.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use v2v_rs::state::{ConversionState, DiskProgress, MessageKind, StateMessage};

use crate::error::WrapperError;

pub struct StateStore {
    state: ConversionState,
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        StateStore {
            state: ConversionState::default(),
            path,
        }
    }

    pub fn state(&self) -> &ConversionState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the terminal commit happened; all mutation is refused
    /// from then on.
    pub fn is_finished(&self) -> bool {
        self.state.finished
    }

    /// Pre-populate the disk list from the request's `source_disks`,
    /// before the backend has said anything.
    pub fn seed_disks(&mut self, paths: &[String]) {
        if self.refuse_if_finished("seed_disks") {
            return;
        }
        for path in paths {
            self.touch_disk(path);
        }
        self.state.disk_count = Some(paths.len());
    }

    pub fn mark_started(&mut self, pid: u32) {
        if self.refuse_if_finished("mark_started") {
            return;
        }
        self.state.started = true;
        self.state.pid = Some(pid);
    }

    /// Append a zero-progress entry for `path` unless it is already
    /// tracked. Paths are unique within a job.
    pub fn touch_disk(&mut self, path: &str) {
        if self.refuse_if_finished("touch_disk") {
            return;
        }
        if self.state.disks.iter().any(|d| d.path == path) {
            return;
        }
        debug!("Tracking new disk path: {}", path);
        self.state.disks.push(DiskProgress {
            path: path.to_string(),
            progress: 0,
        });
    }

    /// Update progress for a known path, clamped to 0..=100.
    /// Last-writer-wins; regressions reported by the backend are kept
    /// as-is rather than corrected.
    pub fn set_progress(&mut self, path: &str, percent: f64) {
        if self.refuse_if_finished("set_progress") {
            return;
        }
        let clamped = percent.clamp(0.0, 100.0) as u8;
        match self.state.disks.iter_mut().find(|d| d.path == path) {
            Some(disk) => disk.progress = clamped,
            None => debug!("Skipping progress update for unknown disk: {}", path),
        }
    }

    /// Revise the backend's claimed disk total. The backend re-announces
    /// the total on every per-disk copy banner, so this is
    /// last-writer-wins in both directions.
    pub fn set_disk_count(&mut self, count: usize) {
        if self.refuse_if_finished("set_disk_count") {
            return;
        }
        if self.state.disk_count.is_some_and(|c| c != count) {
            warn!(
                "Number of tracked disk paths ({}) does not match backend \
                 disk count ({})",
                self.state.disks.len(),
                count
            );
        }
        self.state.disk_count = Some(count);
    }

    /// Record the first user-facing error of the run.
    pub fn record_error(&mut self, message: &str) {
        if self.refuse_if_finished("record_error") {
            return;
        }
        if self.state.last_message.is_some() {
            return;
        }
        self.state.last_message = Some(StateMessage {
            message: message.to_string(),
            kind: MessageKind::Error,
        });
    }

    /// Terminal commit. After this the state never changes again.
    pub fn finalize(&mut self, return_code: Option<i32>, failed: bool) {
        if self.refuse_if_finished("finalize") {
            return;
        }
        self.state.return_code = return_code;
        self.state.failed = failed;
        self.state.finished = true;
        info!(
            "Finalized job state: return_code={:?} failed={}",
            return_code, failed
        );
    }

    /// Atomically replace the state file with the current snapshot.
    ///
    /// A failed write is retried once; a second failure is reported to
    /// the caller, who logs it and carries on (the next successful
    /// write restores visibility).
    pub fn persist(&self) -> Result<(), WrapperError> {
        match self.persist_once() {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("State file write failed, retrying once: {}", first);
                self.persist_once().map_err(|source| WrapperError::Persistence {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }

    /// Persist a terminal snapshot; inability to ever commit it is the
    /// worst observable failure mode, so it is escalated to the highest
    /// severity instead of being returned.
    pub fn persist_terminal(&self) {
        if let Err(e) = self.persist() {
            error!("Unable to commit terminal job state: {}", e);
        }
    }

    fn persist_once(&self) -> std::io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, &self.state)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn refuse_if_finished(&self, op: &str) -> bool {
        if self.state.finished {
            warn!("Ignoring {} after terminal state was committed", op);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> StateStore {
        StateStore::new(dir.join("job.state"))
    }

    fn read_state(store: &StateStore) -> serde_json::Value {
        let content = std::fs::read_to_string(store.path()).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[test]
    fn seeded_disks_appear_with_zero_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.seed_disks(&["[ds1] vm1/vm1.vmdk".to_string()]);
        store.persist().unwrap();

        let json = read_state(&store);
        assert_eq!(json["disk_count"], 1);
        assert_eq!(json["disks"][0]["path"], "[ds1] vm1/vm1.vmdk");
        assert_eq!(json["disks"][0]["progress"], 0);
    }

    #[test]
    fn duplicate_paths_are_tracked_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.touch_disk("[ds1] vm/a.vmdk");
        store.touch_disk("[ds1] vm/a.vmdk");
        assert_eq!(store.state().disks.len(), 1);
    }

    #[test]
    fn progress_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.touch_disk("a");
        store.set_progress("a", 174.3);
        assert_eq!(store.state().disks[0].progress, 100);
        store.set_progress("a", -3.0);
        assert_eq!(store.state().disks[0].progress, 0);
    }

    #[test]
    fn progress_regressions_are_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.touch_disk("a");
        store.set_progress("a", 80.0);
        store.set_progress("a", 50.0);
        assert_eq!(store.state().disks[0].progress, 50);
    }

    #[test]
    fn disk_count_follows_the_last_announcement() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.set_disk_count(3);
        store.set_disk_count(2);
        assert_eq!(store.state().disk_count, Some(2));
    }

    #[test]
    fn no_mutation_after_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.touch_disk("a");
        store.finalize(Some(0), false);

        store.set_progress("a", 50.0);
        store.touch_disk("b");
        store.record_error("late");
        store.finalize(Some(1), true);

        let state = store.state();
        assert_eq!(state.disks.len(), 1);
        assert_eq!(state.disks[0].progress, 0);
        assert_eq!(state.return_code, Some(0));
        assert!(!state.failed);
        assert!(state.last_message.is_none());
    }

    #[test]
    fn only_the_first_error_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.record_error("first");
        store.record_error("second");
        assert_eq!(store.state().last_message.as_ref().unwrap().message, "first");
    }

    #[test]
    fn state_file_is_always_complete_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        for i in 0..20 {
            store.touch_disk(&format!("disk-{}", i));
            store.set_progress(&format!("disk-{}", i), (i * 5) as f64);
            store.persist().unwrap();
            // Sampled at an arbitrary point, the file parses.
            read_state(&store);
        }
    }
}
