//! TLS client configuration: trust roots, optional client certificate, optional skip-verify.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Accept any server certificate.
    pub insecure: bool,
    pub user_cert: Option<PathBuf>,
    /// Defaults to `user_cert` when unset.
    pub user_key: Option<PathBuf>,
}

/// Key file to load for `cert`: the explicit key path, or the certificate file itself.
pub fn resolve_key_path(cert: &Path, key: Option<&Path>) -> PathBuf {
    key.unwrap_or(cert).to_path_buf()
}

pub fn build_tls_config(options: &TlsOptions) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let mut config = match &options.user_cert {
        Some(cert_path) => {
            let key_path = resolve_key_path(cert_path, options.user_key.as_deref());
            let certs = load_certs(cert_path)?;
            let key = load_key(&key_path)?;
            tracing::info!(cert = %cert_path.display(), key = %key_path.display(), "client certificate loaded");
            builder
                .with_client_auth_cert(certs, key)
                .with_context(|| format!("Using client certificate {}", cert_path.display()))?
        }
        None => builder.with_no_client_auth(),
    };

    if options.insecure {
        tracing::warn!("server certificate validation disabled (--insecure)");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
    }
    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Reading certificates from {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Reading private key from {}", path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}

/// Skips chain and hostname validation; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mumble-cli-tls-{}-{}",
            name,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn key_path_defaults_to_cert_path() {
        let cert = Path::new("/home/me/mumble.pem");
        assert_eq!(resolve_key_path(cert, None), PathBuf::from("/home/me/mumble.pem"));
        assert_eq!(
            resolve_key_path(cert, Some(Path::new("/home/me/mumble.key"))),
            PathBuf::from("/home/me/mumble.key")
        );
    }

    #[test]
    fn default_config_trusts_web_roots() {
        let config = build_tls_config(&TlsOptions::default()).unwrap();
        assert!(!config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn insecure_config_builds() {
        let options = TlsOptions {
            insecure: true,
            ..Default::default()
        };
        assert!(build_tls_config(&options).is_ok());
    }

    #[test]
    fn missing_certificate_file_names_the_path() {
        let options = TlsOptions {
            user_cert: Some(PathBuf::from("/nonexistent/mumble-cert.pem")),
            ..Default::default()
        };
        let err = build_tls_config(&options).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/mumble-cert.pem"));
    }

    #[test]
    fn file_without_pem_blocks_is_rejected() {
        let path = temp_file("empty.pem", "not a certificate\n");
        let err = load_certs(&path).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
        let err = load_key(&path).unwrap_err();
        assert!(err.to_string().contains("No private key found"));
    }
}
