//! Admin-TLS certificate manager
//!
//! Watches a directory of `<name>crt.pem` / `<name>key.pem` pairs, keeps a
//! lookup map from certificate names (leaf CN and DNS SANs, each with and
//! without a trailing dot) to loaded key pairs, and resolves SNI for the
//! admin API's TLS handshakes.
//!
//! Rotation swaps a freshly built map under the writer lock; handshakes
//! only ever take the reader lock on a complete snapshot. Certificates
//! rotate rarely, handshake reads are the hot path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

const CERT_SUFFIX: &str = "crt.pem";
const KEY_SUFFIX: &str = "key.pem";

const HAVE_CERT: u8 = 0b01;
const HAVE_KEY: u8 = 0b10;

/// Certificate manager errors. Construction errors are fatal; rescan
/// errors are logged and the previous map stays in service.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("no certificate directory configured")]
    MissingCertDir,

    #[error("failed to read certificate directory '{dir}': {source}")]
    ReadDir {
        dir: String,
        source: std::io::Error,
    },

    #[error("failed to read '{file}': {source}")]
    ReadFile {
        file: String,
        source: std::io::Error,
    },

    #[error("no usable certificates in '{dir}'")]
    NoCertificates { dir: String },

    #[error("bad certificate '{file}': {reason}")]
    BadCertificate { file: String, reason: String },
}

type CertMap = BTreeMap<String, Arc<CertifiedKey>>;

/// SNI resolver over the current certificate map.
///
/// Resolution order: exact server-name match, then the wildcard form with
/// the leftmost label replaced by `*`, then a deterministic fallback (the
/// lexicographically first entry, so the pick is stable across rescans).
pub struct CertResolver {
    certs: RwLock<CertMap>,
}

impl CertResolver {
    fn new() -> Self {
        Self {
            certs: RwLock::new(CertMap::new()),
        }
    }

    fn swap(&self, next: CertMap) {
        let mut certs = self.certs.write().expect("cert map lock poisoned");
        *certs = next;
    }

    /// Number of lookup keys currently installed.
    pub fn len(&self) -> usize {
        self.certs.read().expect("cert map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let certs = self.certs.read().expect("cert map lock poisoned");
        if certs.is_empty() {
            return None;
        }

        let name = match server_name {
            // Without SNI (or with a single configured cert) any entry will
            // have to do.
            None => return certs.values().next().cloned(),
            Some(name) => name,
        };
        if certs.len() == 1 {
            return certs.values().next().cloned();
        }

        if let Some(cert) = certs.get(name) {
            debug!(server_name = %name, "Direct certificate match");
            return Some(cert.clone());
        }

        let wildcard = wildcard_form(name);
        if let Some(cert) = certs.get(&wildcard) {
            debug!(server_name = %name, wildcard = %wildcard, "Wildcard certificate match");
            return Some(cert.clone());
        }

        let (fallback, cert) = certs.iter().next().expect("map checked non-empty");
        debug!(server_name = %name, fallback = %fallback, "No certificate match, using fallback");
        Some(cert.clone())
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .certs
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CertResolver").field("keys", &keys).finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.lookup(client_hello.server_name())
    }
}

/// Replace the leftmost label with `*`. No trailing dot: SNI names arrive
/// without one, so a dotted wildcard key would never match.
fn wildcard_form(name: &str) -> String {
    let mut labels: Vec<&str> = name.split('.').collect();
    if let Some(first) = labels.first_mut() {
        *first = "*";
    }
    labels.join(".")
}

/// Configuration from the `[cert]` config table.
#[derive(Debug, Clone)]
pub struct CertManagerConfig {
    pub active: bool,
    /// Rescan interval in seconds; 0 disables rescanning.
    pub interval_secs: u64,
    pub cert_dir: PathBuf,
}

/// Directory-backed certificate store with periodic rescan.
#[derive(Debug)]
pub struct CertManager {
    active: bool,
    cert_dir: PathBuf,
    interval: Option<Duration>,
    resolver: Arc<CertResolver>,
}

impl CertManager {
    /// Build the manager and perform the initial scan. An inactive manager
    /// is inert: it resolves nothing and its run loop returns immediately.
    pub fn new(config: CertManagerConfig) -> Result<Self, CertError> {
        let resolver = Arc::new(CertResolver::new());

        if !config.active {
            return Ok(Self {
                active: false,
                cert_dir: config.cert_dir,
                interval: None,
                resolver,
            });
        }

        if config.cert_dir.as_os_str().is_empty() {
            return Err(CertError::MissingCertDir);
        }

        let interval = match config.interval_secs {
            0 => {
                warn!("No interval set for scanning cert directory, won't be refreshing");
                None
            }
            secs => Some(Duration::from_secs(secs)),
        };

        let manager = Self {
            active: true,
            cert_dir: config.cert_dir,
            interval,
            resolver,
        };

        let map = scan_cert_dir(&manager.cert_dir)?;
        if map.is_empty() {
            return Err(CertError::NoCertificates {
                dir: manager.cert_dir.display().to_string(),
            });
        }
        info!(keys = map.len(), dir = %manager.cert_dir.display(), "Certificates loaded");
        manager.resolver.swap(map);

        Ok(manager)
    }

    /// The SNI resolver to hand to the TLS config.
    pub fn resolver(&self) -> Arc<CertResolver> {
        self.resolver.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Periodic rescan loop. Rescan failures keep the previous map in
    /// service; only cancellation ends the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CertError> {
        if !self.active {
            return Ok(());
        }

        let Some(interval) = self.interval else {
            cancel.cancelled().await;
            return Ok(());
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial scan already
        // happened in the constructor.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match scan_cert_dir(&self.cert_dir) {
                    Ok(map) => {
                        debug!(keys = map.len(), "Re-scan of cert dir done");
                        self.resolver.swap(map);
                    }
                    Err(e) => error!(error = %e, "Failed scanning cert directory"),
                },
            }
        }

        info!("Cert handler shutdown done");
        Ok(())
    }
}

/// Scan the directory, load complete `crt.pem`/`key.pem` pairs, and build
/// the lookup map. Broken pairs are skipped with an error log so one bad
/// rotation cannot take down the rest.
fn scan_cert_dir(dir: &Path) -> Result<CertMap, CertError> {
    let entries = std::fs::read_dir(dir).map_err(|source| CertError::ReadDir {
        dir: dir.display().to_string(),
        source,
    })?;

    let mut found: HashMap<String, u8> = HashMap::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(CERT_SUFFIX) {
            *found.entry(stem.to_string()).or_default() |= HAVE_CERT;
        }
        if let Some(stem) = name.strip_suffix(KEY_SUFFIX) {
            *found.entry(stem.to_string()).or_default() |= HAVE_KEY;
        }
    }

    let mut map = CertMap::new();
    for (stem, bits) in found {
        if bits != HAVE_CERT | HAVE_KEY {
            continue;
        }
        let cert_file = dir.join(format!("{stem}{CERT_SUFFIX}"));
        let key_file = dir.join(format!("{stem}{KEY_SUFFIX}"));
        debug!(cert = %cert_file.display(), "Attempting to load certificate");

        match load_key_pair(&cert_file, &key_file) {
            Ok((names, certified)) => {
                for name in names {
                    let bare = name.trim_end_matches('.').to_string();
                    map.insert(format!("{bare}."), certified.clone());
                    map.insert(bare, certified.clone());
                }
            }
            Err(e) => {
                error!(cert = %cert_file.display(), error = %e, "Failed to load certificate pair");
                continue;
            }
        }
    }

    Ok(map)
}

/// Load one PEM pair and extract the leaf's names (common name plus every
/// DNS SAN).
fn load_key_pair(
    cert_file: &Path,
    key_file: &Path,
) -> Result<(Vec<String>, Arc<CertifiedKey>), CertError> {
    let read_err = |file: &Path, source: std::io::Error| CertError::ReadFile {
        file: file.display().to_string(),
        source,
    };
    let bad_cert = |reason: String| CertError::BadCertificate {
        file: cert_file.display().to_string(),
        reason,
    };

    let mut reader = BufReader::new(File::open(cert_file).map_err(|e| read_err(cert_file, e))?);
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| bad_cert(format!("bad PEM: {e}")))?;
    let leaf = chain
        .first()
        .ok_or_else(|| bad_cert("no certificates in file".to_string()))?;

    let mut names = Vec::new();
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| bad_cert(format!("bad X.509: {e}")))?;
    for cn in parsed.subject().iter_common_name() {
        match cn.as_str() {
            Ok(cn) => names.push(cn.to_string()),
            Err(e) => warn!(cert = %cert_file.display(), error = %e, "Unreadable common name"),
        }
    }
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns_name) = general_name {
                debug!(dns_name = %dns_name, "Found DNS name in cert");
                names.push((*dns_name).to_string());
            }
        }
    }
    if names.is_empty() {
        return Err(bad_cert("certificate carries no usable names".to_string()));
    }

    let mut key_reader = BufReader::new(File::open(key_file).map_err(|e| read_err(key_file, e))?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| CertError::BadCertificate {
            file: key_file.display().to_string(),
            reason: format!("bad PEM: {e}"),
        })?
        .ok_or_else(|| CertError::BadCertificate {
            file: key_file.display().to_string(),
            reason: "no private key in file".to_string(),
        })?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
        CertError::BadCertificate {
            file: key_file.display().to_string(),
            reason: format!("unsupported key type: {e}"),
        }
    })?;

    Ok((names, Arc::new(CertifiedKey::new(chain, signing_key))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_form() {
        assert_eq!(wildcard_form("admin.example.com"), "*.example.com");
        assert_eq!(wildcard_form("single"), "*");
    }

    #[test]
    fn test_inactive_manager_is_inert() {
        let manager = CertManager::new(CertManagerConfig {
            active: false,
            interval_secs: 0,
            cert_dir: PathBuf::new(),
        })
        .unwrap();
        assert!(!manager.is_active());
        assert!(manager.resolver().is_empty());
    }

    #[test]
    fn test_active_manager_requires_cert_dir() {
        let err = CertManager::new(CertManagerConfig {
            active: true,
            interval_secs: 0,
            cert_dir: PathBuf::new(),
        })
        .unwrap_err();
        assert!(matches!(err, CertError::MissingCertDir));
    }

    #[test]
    fn test_scan_skips_unpaired_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lonelycrt.pem"), "not even pem").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();
        let map = scan_cert_dir(dir.path()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_scan_missing_dir_errors() {
        assert!(matches!(
            scan_cert_dir(Path::new("/no/such/dir")),
            Err(CertError::ReadDir { .. })
        ));
    }

    #[test]
    fn test_broken_pair_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("badcrt.pem"), "garbage").unwrap();
        std::fs::write(dir.path().join("badkey.pem"), "garbage").unwrap();
        let map = scan_cert_dir(dir.path()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_resolver_empty_resolves_nothing() {
        let resolver = CertResolver::new();
        assert!(resolver.lookup(Some("admin.example.com")).is_none());
        assert!(resolver.lookup(None).is_none());
    }
}
