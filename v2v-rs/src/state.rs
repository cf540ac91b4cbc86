//! Schema of the durable state file polled by orchestrators.
//!
//! The wrapper rewrites the whole document atomically after every
//! observable change, so a poller always sees a complete JSON object.
//! Keys only ever accumulate over the lifetime of a job: `started` and
//! `pid` appear once the subprocess is up, `disks`/`disk_count` evolve
//! during the copy, and `return_code`/`finished`/`failed` arrive with
//! the terminal commit. Success is signaled by the *absence* of
//! `failed` once `finished` is true, not by the raw return code.

use serde::{Deserialize, Serialize};

/// Per-disk copy progress, keyed by the backend-reported path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskProgress {
    pub path: String,
    /// Percentage in 0..=100.
    pub progress: u8,
}

/// First user-facing error message observed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Error,
}

/// The full state-file document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionState {
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub disks: Vec<DiskProgress>,
    /// The backend's claimed disk total. May diverge from `disks.len()`;
    /// `disks` stays authoritative for per-path progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    pub finished: bool,
    /// Present (and true) only for unsuccessful runs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<StateMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_is_absent_on_success() {
        let state = ConversionState {
            started: true,
            pid: Some(4242),
            disks: vec![DiskProgress { path: "[ds1] vm/vm.vmdk".into(), progress: 100 }],
            disk_count: Some(1),
            return_code: Some(0),
            finished: true,
            failed: false,
            last_message: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("failed").is_none());
        assert_eq!(json["return_code"], 0);
        assert_eq!(json["finished"], true);
    }

    #[test]
    fn failed_is_present_on_failure() {
        let state = ConversionState {
            finished: true,
            failed: true,
            return_code: Some(1),
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["failed"], true);
    }

    #[test]
    fn optional_keys_are_omitted_until_known() {
        let json = serde_json::to_value(ConversionState::default()).unwrap();
        assert!(json.get("pid").is_none());
        assert!(json.get("disk_count").is_none());
        assert!(json.get("return_code").is_none());
        assert!(json.get("last_message").is_none());
        assert_eq!(json["started"], false);
    }
}
