//! TLS material loading.
//!
//! The key store is a PEM bundle holding the certificate chain and one
//! private key (PKCS#8, PKCS#1 or SEC1).

use crate::store::ConfigStore;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Key store used when an import names no destination.
pub const DEFAULT_KEY_STORE: &str = "DATA/SETTINGS/keystore.pem";

/// TLS setup errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read key store '{0}': {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("key store '{0}' holds no certificate")]
    NoCertificate(PathBuf),
    #[error("key store '{0}' holds no private key")]
    NoPrivateKey(PathBuf),
    #[error("cannot import '{0}' into '{1}': {2}")]
    Import(PathBuf, PathBuf, #[source] io::Error),
    #[error("invalid TLS material: {0}")]
    Config(#[from] rustls::Error),
}

/// Build a server config from the PEM bundle at `path`.
pub fn load_server_config(path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Read(path.to_path_buf(), e))?;
    let items = rustls_pemfile::read_all(&mut BufReader::new(file))
        .map_err(|e| TlsError::Read(path.to_path_buf(), e))?;

    let mut certs = Vec::new();
    let mut key = None;
    for item in items {
        match item {
            Item::X509Certificate(der) => certs.push(Certificate(der)),
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => {
                key.get_or_insert(PrivateKey(der));
            }
            _ => {}
        }
    }

    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    let key = key.ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Copy a pending import (`pkcs12ImportFile`) into the key store.
///
/// Returns the key store path when an import happened. The import keys are
/// cleared afterwards so it runs once.
pub fn import_pending(store: &ConfigStore) -> Result<Option<PathBuf>, TlsError> {
    let import = store.get("pkcs12ImportFile", "");
    if import.trim().is_empty() {
        return Ok(None);
    }
    let source = PathBuf::from(import.trim());

    let target = match store.get("keyStore", "") {
        ks if ks.trim().is_empty() => PathBuf::from(DEFAULT_KEY_STORE),
        ks => PathBuf::from(ks.trim()),
    };

    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| TlsError::Import(source.clone(), target.clone(), e))?;
    }
    fs::copy(&source, &target).map_err(|e| TlsError::Import(source.clone(), target.clone(), e))?;

    if !store.get("pkcs12ImportPwd", "").is_empty() {
        warn!("Ignoring pkcs12ImportPwd, PEM bundles are not encrypted");
    }

    store.set("keyStore", target.to_string_lossy());
    store.set("pkcs12ImportFile", "");
    store.set("pkcs12ImportPwd", "");
    info!(from = %source.display(), to = %target.display(), "Imported key store");
    Ok(Some(target))
}

/// TLS config described by the store, if TLS is configured.
pub fn from_store(store: &ConfigStore) -> Result<Option<Arc<ServerConfig>>, TlsError> {
    import_pending(store)?;

    let key_store = store.get("keyStore", "");
    if key_store.trim().is_empty() {
        return Ok(None);
    }
    if !store.get("keyStorePassword", "").is_empty() {
        warn!("Ignoring keyStorePassword, PEM bundles are not encrypted");
    }

    let path = PathBuf::from(key_store.trim());
    let config = load_server_config(&path)?;
    info!(key_store = %path.display(), "TLS enabled");
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn store(pairs: &[(&str, &str)]) -> ConfigStore {
        ConfigStore::in_memory(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_no_key_store_means_plaintext() {
        assert!(from_store(&store(&[])).unwrap().is_none());
    }

    #[test]
    fn test_missing_key_store_is_fatal() {
        let result = from_store(&store(&[("keyStore", "/nonexistent/keystore.pem")]));
        assert!(matches!(result, Err(TlsError::Read(..))));
    }

    #[test]
    fn test_bundle_without_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, "not a pem file\n").unwrap();
        assert!(matches!(
            load_server_config(&path),
            Err(TlsError::NoCertificate(_))
        ));
    }

    #[test]
    fn test_import_copies_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("import.pem");
        let target = dir.path().join("nested/keystore.pem");
        fs::write(&source, "bundle").unwrap();

        let store = store(&[
            ("pkcs12ImportFile", source.to_str().unwrap()),
            ("pkcs12ImportPwd", "secret"),
            ("keyStore", target.to_str().unwrap()),
        ]);
        let imported = import_pending(&store).unwrap();

        assert_eq!(imported.as_deref(), Some(target.as_path()));
        assert_eq!(fs::read_to_string(&target).unwrap(), "bundle");
        assert_eq!(store.get("pkcs12ImportFile", "x"), "");
        assert_eq!(store.get("pkcs12ImportPwd", "x"), "");
        assert_eq!(store.get("keyStore", ""), target.to_string_lossy());
        assert!(import_pending(&store).unwrap().is_none());
    }

    #[test]
    fn test_import_of_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&[
            ("pkcs12ImportFile", "/nonexistent/import.pem"),
            ("keyStore", dir.path().join("ks.pem").to_str().unwrap()),
        ]);
        assert!(matches!(import_pending(&store), Err(TlsError::Import(..))));
    }
}
