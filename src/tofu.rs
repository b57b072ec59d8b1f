//! Trust-on-first-use host verification.
//!
//! On first contact a server's certificate fingerprint is unknown; the
//! caller's policy callback decides whether to pin it. On later contacts the
//! presented fingerprint is compared against the pinned one, and a mismatch
//! (the signature of an interposed endpoint) is escalated to the same
//! callback.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::known_hosts::{self, KnownHostsError};

const DOT_DIR: &str = ".neo4j";
const KNOWN_HOSTS_FILE: &str = "neo4j_known_certs";
const MAX_HOSTNAME_LENGTH: usize = 256;

/// Why a host could not be verified against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnverifiedReason {
    /// No fingerprint is pinned for this host.
    Unrecognized,
    /// A fingerprint is pinned and the presented one differs.
    Mismatch,
}

impl std::fmt::Display for UnverifiedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnverifiedReason::Unrecognized => "unrecognized",
            UnverifiedReason::Mismatch => "mismatch",
        };
        write!(f, "{name}")
    }
}

/// A policy decision returned by the unverified-host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostVerification {
    /// Pin the presented fingerprint and verify this and future connections.
    Trust,
    /// Verify this connection without pinning anything.
    AcceptOnce,
    /// Reject the connection.
    #[default]
    Reject,
}

/// The outcome of a host verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Rejected,
}

/// The policy callback invoked for hosts the store cannot vouch for.
///
/// Receives the host label (`hostname:port`), the presented fingerprint and
/// the reason verification did not succeed. May prompt the user or consult
/// configuration, and is expected to return promptly; no store state is held
/// while it runs, so a slow callback delays only its own verification. It
/// must not re-enter host verification itself.
pub type UnverifiedHostCallback =
    dyn Fn(&str, &str, UnverifiedReason) -> HostVerification + Send + Sync;

/// Configuration for host verification.
#[derive(Clone, Default)]
pub struct TofuConfig {
    known_hosts_file: Option<PathBuf>,
    callback: Option<Arc<UnverifiedHostCallback>>,
}

impl TofuConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the location of the known hosts file.
    ///
    /// Without an override the file lives at `~/.neo4j/neo4j_known_certs`.
    pub fn known_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_file = Some(path.into());
        self
    }

    /// Installs the policy callback for unverified hosts.
    ///
    /// Without a callback every unverified host is rejected.
    pub fn on_unverified(
        mut self,
        callback: impl Fn(&str, &str, UnverifiedReason) -> HostVerification + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for TofuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TofuConfig")
            .field("known_hosts_file", &self.known_hosts_file)
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .finish()
    }
}

/// The default location of the known hosts file.
pub fn default_known_hosts_file() -> Result<PathBuf, KnownHostsError> {
    dirs::home_dir()
        .map(|home| home.join(DOT_DIR).join(KNOWN_HOSTS_FILE))
        .ok_or(KnownHostsError::NoDefaultPath)
}

/// Verifies a server's certificate fingerprint against the known hosts store.
///
/// The fingerprint pinned for `hostname:port` is compared byte-exactly
/// against `fingerprint`. When the host is unknown or the fingerprints
/// differ, the configured callback decides: `Trust` pins the presented
/// fingerprint (replacing any previous entry) and verifies, `AcceptOnce`
/// verifies without pinning, anything else rejects. Without a callback the
/// connection is rejected.
///
/// Store failures surface as errors, not as rejection; that includes a
/// failure to pin after a `Trust` decision.
pub fn check_known_hosts(
    hostname: &str,
    port: u16,
    fingerprint: &str,
    config: &TofuConfig,
) -> Result<Verification, KnownHostsError> {
    if hostname.is_empty() || hostname.len() >= MAX_HOSTNAME_LENGTH {
        return Err(KnownHostsError::InvalidHostname);
    }

    let file = match &config.known_hosts_file {
        Some(path) => path.clone(),
        None => default_known_hosts_file()?,
    };

    let host = format!("{hostname}:{port}");
    let reason = match known_hosts::lookup(&file, &host)? {
        Some(stored) if stored == fingerprint => {
            debug!(%host, "fingerprint matches pinned entry");
            return Ok(Verification::Verified);
        }
        Some(_) => UnverifiedReason::Mismatch,
        None => UnverifiedReason::Unrecognized,
    };

    let Some(callback) = &config.callback else {
        warn!(%host, %reason, "unverified host rejected (no callback installed)");
        return Ok(Verification::Rejected);
    };

    match callback(&host, fingerprint, reason) {
        HostVerification::Trust => {
            known_hosts::replace(&file, &host, fingerprint)?;
            debug!(%host, "fingerprint pinned");
            Ok(Verification::Verified)
        }
        HostVerification::AcceptOnce => {
            debug!(%host, "fingerprint accepted for this connection only");
            Ok(Verification::Verified)
        }
        HostVerification::Reject => {
            warn!(%host, %reason, "unverified host rejected by callback");
            Ok(Verification::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    fn config_for(dir: &TempDir) -> TofuConfig {
        TofuConfig::new().known_hosts_file(dir.path().join("known_certs"))
    }

    #[test]
    fn test_unknown_host_without_callback_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);

        let result = check_known_hosts("db.example", 7687, "AA:BB", &config).unwrap();
        assert_eq!(result, Verification::Rejected);
        assert!(!dir.path().join("known_certs").exists());
    }

    #[test]
    fn test_trust_pins_fingerprint() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir).on_unverified(|_, _, _| HostVerification::Trust);

        let result = check_known_hosts("db.example", 7687, "AA:BB", &config).unwrap();
        assert_eq!(result, Verification::Verified);

        let contents = fs::read_to_string(dir.path().join("known_certs")).unwrap();
        assert_eq!(contents, "db.example:7687 AA:BB\n");
    }

    #[test]
    fn test_pinned_fingerprint_verifies_without_callback_call() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let config = config_for(&dir).on_unverified(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            HostVerification::Trust
        });

        check_known_hosts("db.example", 7687, "AA:BB", &config).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let result = check_known_hosts("db.example", 7687, "AA:BB", &config).unwrap();
        assert_eq!(result, Verification::Verified);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "callback must not run again");
    }

    #[test]
    fn test_mismatch_reaches_callback_with_reason() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let config = config_for(&dir).on_unverified(move |host, fingerprint, reason| {
            *sink.lock().unwrap() = Some((host.to_string(), fingerprint.to_string(), reason));
            HostVerification::AcceptOnce
        });

        known_hosts::replace(&dir.path().join("known_certs"), "db.example:7687", "AA:BB")
            .unwrap();

        let result = check_known_hosts("db.example", 7687, "CC:DD", &config).unwrap();
        assert_eq!(result, Verification::Verified);

        let (host, fingerprint, reason) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(host, "db.example:7687");
        assert_eq!(fingerprint, "CC:DD");
        assert_eq!(reason, UnverifiedReason::Mismatch);

        // accept-once must not touch the store
        let contents = fs::read_to_string(dir.path().join("known_certs")).unwrap();
        assert_eq!(contents, "db.example:7687 AA:BB\n");
    }

    #[test]
    fn test_mismatch_with_trust_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir).on_unverified(|_, _, _| HostVerification::Trust);

        known_hosts::replace(&dir.path().join("known_certs"), "db.example:7687", "AA:BB")
            .unwrap();
        check_known_hosts("db.example", 7687, "CC:DD", &config).unwrap();

        let contents = fs::read_to_string(dir.path().join("known_certs")).unwrap();
        assert_eq!(contents, "db.example:7687 CC:DD\n");
    }

    #[test]
    fn test_unknown_host_reason_is_unrecognized() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let config = config_for(&dir).on_unverified(move |_, _, reason| {
            *sink.lock().unwrap() = Some(reason);
            HostVerification::Reject
        });

        let result = check_known_hosts("db.example", 7687, "AA:BB", &config).unwrap();
        assert_eq!(result, Verification::Rejected);
        assert_eq!(
            seen.lock().unwrap().unwrap(),
            UnverifiedReason::Unrecognized
        );
    }

    #[test]
    fn test_ports_are_distinct_hosts() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir).on_unverified(|_, _, _| HostVerification::Trust);

        check_known_hosts("db.example", 7687, "AA:BB", &config).unwrap();
        check_known_hosts("db.example", 7688, "CC:DD", &config).unwrap();

        let file = dir.path().join("known_certs");
        assert_eq!(
            known_hosts::lookup(&file, "db.example:7687").unwrap().as_deref(),
            Some("AA:BB")
        );
        assert_eq!(
            known_hosts::lookup(&file, "db.example:7688").unwrap().as_deref(),
            Some("CC:DD")
        );
    }

    #[test]
    fn test_invalid_hostnames_are_errors() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);

        let err = check_known_hosts("", 7687, "AA:BB", &config).err().unwrap();
        assert!(matches!(err, KnownHostsError::InvalidHostname));

        let long = "h".repeat(MAX_HOSTNAME_LENGTH);
        let err = check_known_hosts(&long, 7687, "AA:BB", &config).err().unwrap();
        assert!(matches!(err, KnownHostsError::InvalidHostname));
    }
}
