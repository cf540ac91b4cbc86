//! Types used in the interface between the orchestrator and the
//! conversion-job wrapper.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Disk image format produced by the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Qcow2,
}

impl OutputFormat {
    /// Value passed to the conversion binary's `-of` argument.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::Qcow2 => "qcow2",
        }
    }
}

/// How the conversion binary reaches the source hypervisor's disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMethod {
    Vddk,
    Ssh,
}

/// A secret value carried in the job request. Deserializes as a plain
/// string but never reveals its content through `Debug`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(pub String);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("*****")
    }
}

/// Source-to-destination network mapping applied to the converted
/// guest's NICs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMapping {
    pub source: String,
    pub destination: String,
    pub mac_address: Option<String>,
}

/// One conversion job, read as a single JSON document from standard
/// input. Immutable once loaded.
///
/// Required keys depend on the transport: `vddk` needs the VMware URI,
/// password and certificate fingerprint, `ssh` needs the URI and a
/// private key. Validation lives in the wrapper binary; this type only
/// pins the schema.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub vm_name: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    pub transport_method: TransportMethod,
    pub vmware_uri: Option<String>,
    pub vmware_password: Option<Secret>,
    /// Hash of the source server's TLS certificate, used for
    /// opportunistic trust verification instead of CA validation.
    pub vmware_fingerprint: Option<String>,
    pub ssh_key: Option<Secret>,
    /// oVirt export-domain target. When absent the wrapper produces
    /// local JSON-directory output.
    pub export_domain: Option<String>,
    /// Ordered disk paths as the source hypervisor reports them. Used
    /// to pre-populate the state file before the backend announces
    /// anything.
    pub source_disks: Option<Vec<String>>,
    pub network_mappings: Option<Vec<NetworkMapping>>,
    /// Keep running as the invoking identity even when the job would
    /// normally drop to the service account.
    #[serde(default)]
    pub run_as_current: bool,
    /// Detach from the caller after the bootstrap line. Defaults to
    /// true; pods run the wrapper in the foreground instead.
    pub daemonize: Option<bool>,
}

impl JobRequest {
    pub fn daemonize(&self) -> bool {
        self.daemonize.unwrap_or(true)
    }
}

/// The single JSON line emitted on standard output before detaching,
/// telling the caller where to find the wrapper's output files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapInfo {
    pub wrapper_log: PathBuf,
    pub v2v_log: PathBuf,
    pub state_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_defaults_to_raw() {
        let req: JobRequest = serde_json::from_str(
            r#"{"vm_name": "vm1", "transport_method": "ssh"}"#,
        )
        .unwrap();
        assert_eq!(req.output_format, OutputFormat::Raw);
        assert!(req.daemonize());
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let res: Result<JobRequest, _> = serde_json::from_str(
            r#"{"vm_name": "vm1", "transport_method": "carrier-pigeon"}"#,
        );
        assert!(res.is_err());

        let res: Result<JobRequest, _> = serde_json::from_str(
            r#"{"vm_name": "vm1", "transport_method": "vddk", "output_format": "vmdk"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let req: JobRequest = serde_json::from_str(
            r#"{
                "vm_name": "vm1",
                "transport_method": "vddk",
                "vmware_uri": "esx://example.com",
                "vmware_password": "hunter2",
                "vmware_fingerprint": "AA:BB"
            }"#,
        )
        .unwrap();
        let debug = format!("{:?}", req);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("*****"));
    }

    #[test]
    fn bootstrap_line_round_trips() {
        let info = BootstrapInfo {
            wrapper_log: "/var/log/vdsm/import/v2v-import-x-wrapper.log".into(),
            v2v_log: "/var/log/vdsm/import/v2v-import-x.log".into(),
            state_file: "/tmp/v2v-import-x.state".into(),
        };
        let line = serde_json::to_string(&info).unwrap();
        assert!(!line.contains('\n'));
        let parsed: BootstrapInfo = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.state_file, info.state_file);
    }
}
