//! Decides which identity the conversion subprocess runs under.
//!
//! The wrapper itself keeps running as whoever invoked it; only the
//! subprocess (and the secret files handed to it) are affected. The
//! decision is a pure function of the request so it can be made, and
//! rejected, before anything irreversible happens.

use std::path::Path;

use log::debug;
use nix::unistd::{Gid, Group, Uid, User};
use v2v_rs::api::JobRequest;

use crate::error::WrapperError;

/// Service account the conversion runs under on oVirt hosts.
pub const SERVICE_USER: &str = "vdsm";
pub const SERVICE_GROUP: &str = "kvm";

/// Outcome of the privilege decision, before any lookup happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Keep the invoking identity.
    Current,
    /// Drop to the designated service account for the subprocess.
    ServiceAccount,
}

/// Identity with resolved uid/gid, ready to apply to a `Command`.
#[derive(Debug, Clone, Copy)]
pub enum RunAs {
    Current,
    User { uid: u32, gid: u32 },
}

/// Pure decision: export-domain targets need root to mount the NFS
/// share, everything else drops to the service account unless the
/// request explicitly opts out.
pub fn decide(request: &JobRequest) -> Identity {
    if request.run_as_current {
        return Identity::Current;
    }
    if request.export_domain.is_some() {
        return Identity::Current;
    }
    Identity::ServiceAccount
}

/// Resolve the decided identity against the passwd/group databases.
///
/// A missing account is fatal: a partially dropped identity is never
/// tolerated, so we refuse to start at all.
pub fn resolve(identity: Identity) -> Result<RunAs, WrapperError> {
    match identity {
        Identity::Current => Ok(RunAs::Current),
        Identity::ServiceAccount => {
            let user = User::from_name(SERVICE_USER)
                .map_err(|e| privilege_error(SERVICE_USER, &e.to_string()))?
                .ok_or_else(|| privilege_error(SERVICE_USER, "no such user"))?;
            let group = Group::from_name(SERVICE_GROUP)
                .map_err(|e| privilege_error(SERVICE_GROUP, &e.to_string()))?
                .ok_or_else(|| privilege_error(SERVICE_GROUP, "no such group"))?;
            debug!(
                "Conversion will run as {}:{} ({}:{})",
                SERVICE_USER,
                SERVICE_GROUP,
                user.uid,
                group.gid
            );
            Ok(RunAs::User {
                uid: user.uid.as_raw(),
                gid: group.gid.as_raw(),
            })
        }
    }
}

/// Hand a secret file over to the subprocess identity.
pub fn chown_to(path: &Path, run_as: &RunAs) -> Result<(), WrapperError> {
    if let RunAs::User { uid, gid } = run_as {
        nix::unistd::chown(path, Some(Uid::from_raw(*uid)), Some(Gid::from_raw(*gid)))
            .map_err(|e| privilege_error(SERVICE_USER, &format!("chown {:?}: {}", path, e)))?;
    }
    Ok(())
}

fn privilege_error(account: &str, reason: &str) -> WrapperError {
    WrapperError::Privilege {
        account: account.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v2v_rs::api::TransportMethod;

    fn request(json: &str) -> JobRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn export_domain_targets_stay_root() {
        let req = request(
            r#"{"vm_name": "vm1", "transport_method": "vddk",
                "export_domain": "nfs.example.com:/export"}"#,
        );
        assert_eq!(req.transport_method, TransportMethod::Vddk);
        assert_eq!(decide(&req), Identity::Current);
    }

    #[test]
    fn local_output_drops_to_service_account() {
        let req = request(r#"{"vm_name": "vm1", "transport_method": "vddk"}"#);
        assert_eq!(decide(&req), Identity::ServiceAccount);
    }

    #[test]
    fn explicit_override_wins() {
        let req = request(
            r#"{"vm_name": "vm1", "transport_method": "ssh", "run_as_current": true}"#,
        );
        assert_eq!(decide(&req), Identity::Current);
    }

    #[test]
    fn current_identity_needs_no_lookup() {
        assert!(matches!(resolve(Identity::Current), Ok(RunAs::Current)));
    }
}
