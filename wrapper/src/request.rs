//! Loading and validation of the job request.
//!
//! The wrapper reads exactly one JSON document from standard input.
//! Anything wrong with it is a validation error, reported on stderr
//! with a non-zero exit before any daemonization happens, so the
//! caller gets a synchronous answer.

use std::io::Read;

use v2v_rs::api::{JobRequest, TransportMethod};

use crate::error::WrapperError;

/// Read and validate a single job request from `reader`.
pub fn load(reader: impl Read) -> Result<JobRequest, WrapperError> {
    let request: JobRequest = serde_json::from_reader(reader)
        .map_err(|e| WrapperError::Validation(format!("malformed job request: {}", e)))?;
    validate(&request)?;
    Ok(request)
}

/// Transport-conditional validation, mirroring the keys the conversion
/// command will actually need.
fn validate(request: &JobRequest) -> Result<(), WrapperError> {
    if request.vm_name.is_empty() {
        return Err(missing("vm_name"));
    }

    match request.transport_method {
        TransportMethod::Vddk => {
            if none_or_empty(&request.vmware_uri) {
                return Err(missing("vmware_uri"));
            }
            if request.vmware_password.is_none() {
                return Err(missing("vmware_password"));
            }
            if none_or_empty(&request.vmware_fingerprint) {
                return Err(missing("vmware_fingerprint"));
            }
        }
        TransportMethod::Ssh => {
            if none_or_empty(&request.vmware_uri) {
                return Err(missing("vmware_uri"));
            }
            if request.ssh_key.is_none() {
                return Err(missing("ssh_key"));
            }
        }
    }

    if let Some(mappings) = &request.network_mappings {
        for mapping in mappings {
            if mapping.source.is_empty() || mapping.destination.is_empty() {
                return Err(WrapperError::Validation(
                    "both \"source\" and \"destination\" must be provided \
                     in network mapping"
                        .to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn missing(key: &str) -> WrapperError {
    WrapperError::Validation(format!("missing argument: {}", key))
}

fn none_or_empty(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}
