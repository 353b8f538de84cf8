use std::{error::Error, fs::File, io::BufReader, sync::Arc};

use rustls::{
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::ServerSessionMemoryCache,
    ServerConfig,
};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::ListenerTlsConfig;

/// Loads the TLS configuration from the files and returns a ServerConfig.
///
/// The files should be structured as follows:
/// cert.pem: The certificate chain, leaf first.
/// key.pem: The private key (PKCS#1, PKCS#8 or SEC1).
pub fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<ServerConfig, Box<dyn Error + Send + Sync>> {
    let (cert_chain, key) = load_chain_and_key(cert_path, key_path)?;
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    // Allow session resumption across reconnecting clients
    config.session_storage = ServerSessionMemoryCache::new(256);
    Ok(config)
}

/// Builds the acceptor used for `STARTTLS` on the client listener.
pub fn tls_acceptor(config: &ListenerTlsConfig) -> Result<TlsAcceptor, Box<dyn Error + Send + Sync>> {
    let server_config = load_tls_server_config(&config.cert, &config.key)?;
    info!(cert = %config.cert, "STARTTLS enabled for client connections");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_chain_and_key(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Box<dyn Error + Send + Sync>>
{
    let cert_file = &mut BufReader::new(File::open(cert_path)?);
    let cert_chain = rustls_pemfile::certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    if cert_chain.is_empty() {
        return Err(format!("No certificate found in {cert_path}").into());
    }

    let key_file = &mut BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(key_file)?
        .ok_or_else(|| format!("No private key found in {key_path}"))?;

    Ok((cert_chain, key))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_missing_certificate_file() {
        let result = load_tls_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_certificate_file() {
        let mut cert = NamedTempFile::new().unwrap();
        writeln!(cert, "not a pem file").unwrap();
        let key = NamedTempFile::new().unwrap();

        let error = load_tls_server_config(
            cert.path().to_str().unwrap(),
            key.path().to_str().unwrap(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("No certificate found"));
    }

    #[test]
    fn test_acceptor_reports_missing_files() {
        let config = ListenerTlsConfig {
            cert: "/nonexistent/cert.pem".to_string(),
            key: "/nonexistent/key.pem".to_string(),
        };
        assert!(tls_acceptor(&config).is_err());
    }
}
