//! TLS acceptor for the STOMP listener.

use crate::config::TlsConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{danger::ClientCertVerifier, WebPkiClientVerifier};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds a TLS acceptor from PEM files named in the configuration.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;
    let client_ca = match (config.require_client_cert, config.client_ca_path.as_deref()) {
        (false, _) => None,
        (true, Some(path)) => Some(path),
        (true, None) => {
            return Err(ServerError::TlsConfig(
                "client_ca_path not set for mTLS".into(),
            ))
        }
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = match client_ca {
        Some(path) => builder.with_client_cert_verifier(client_verifier(path)?),
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Verifier accepting client certificates issued by the CAs in `path`.
fn client_verifier(path: &Path) -> Result<Arc<dyn ClientCertVerifier>, ServerError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
    }
    WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ServerError::TlsConfig(format!("failed to build client verifier: {}", e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// Reads the first PKCS#1, PKCS#8 or SEC1 key in the file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn tls_config() -> TlsConfig {
        TlsConfig {
            enabled: true,
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            require_client_cert: false,
            client_ca_path: None,
        }
    }

    fn expect_err(config: &TlsConfig) -> String {
        match create_tls_acceptor(config) {
            Err(e) => e.to_string(),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_missing_files() {
        assert!(load_certs(Path::new("/nonexistent/cert.pem"))
            .unwrap_err()
            .to_string()
            .contains("cannot open"));
        assert!(load_private_key(Path::new("/nonexistent/key.pem"))
            .unwrap_err()
            .to_string()
            .contains("cannot open"));
        assert!(expect_err(&tls_config()).contains("cannot open cert file"));
    }

    #[test]
    fn test_pem_without_contents() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"just some text\n").unwrap();

        assert!(load_private_key(file.path())
            .unwrap_err()
            .to_string()
            .contains("no private key"));
        assert!(load_certs(file.path())
            .unwrap_err()
            .to_string()
            .contains("no certificates"));
    }

    #[test]
    fn test_required_paths() {
        let config = TlsConfig {
            cert_path: None,
            ..tls_config()
        };
        assert!(expect_err(&config).contains("cert_path not set"));

        let config = TlsConfig {
            key_path: None,
            ..tls_config()
        };
        assert!(expect_err(&config).contains("key_path not set"));

        // checked before any file is opened
        let config = TlsConfig {
            require_client_cert: true,
            ..tls_config()
        };
        assert!(expect_err(&config).contains("client_ca_path not set"));
    }
}
