//! TLS material loading. The server channel and (optionally) peer stream
//! links authenticate with the same certificate: the connector presents it
//! as a client certificate, the peer acceptor requires one signed by the
//! configured CA.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{EndpointError, Result};

/// Paths to the endpoint's PEM material.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
}

/// Client-side configuration: trusts only the configured CA and presents
/// the endpoint certificate.
pub fn build_tls_connector(paths: &TlsPaths) -> Result<Arc<TlsConnector>> {
    let roots = load_roots(&paths.ca_path)?;
    let certs = load_certs(&paths.cert_path)?;
    let key = load_key(&paths.key_path)?;
    let cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| EndpointError::Tls(format!("failed to build tls client config: {e}")))?;
    Ok(Arc::new(TlsConnector::from(Arc::new(cfg))))
}

/// Server-side configuration for peer links: requires a client certificate
/// signed by the configured CA.
pub fn build_tls_acceptor(paths: &TlsPaths) -> Result<Arc<TlsAcceptor>> {
    let roots = load_roots(&paths.ca_path)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| EndpointError::Tls(format!("failed to build client verifier: {e}")))?;
    let certs = load_certs(&paths.cert_path)?;
    let key = load_key(&paths.key_path)?;
    let cfg = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| EndpointError::Tls(format!("failed to build tls server config: {e}")))?;
    Ok(Arc::new(TlsAcceptor::from(Arc::new(cfg))))
}

/// Best-effort common-name extraction from a peer's DER certificate, for
/// logging and peer TLS name checks. Scans for the CN attribute type and
/// reads the string value that follows it.
pub fn extract_common_name(der: &[u8]) -> Option<String> {
    // OID 2.5.4.3 (commonName) encoded as ASN.1 OBJECT IDENTIFIER
    const CN_OID: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];
    let pos = der.windows(CN_OID.len()).position(|w| w == CN_OID)?;
    let rest = der.get(pos + CN_OID.len()..)?;
    let tag = *rest.first()?;
    // utf8, printable or ia5 string
    if !matches!(tag, 0x0c | 0x13 | 0x16) {
        return None;
    }
    let len = *rest.get(1)? as usize;
    if len >= 0x80 {
        return None;
    }
    let bytes = rest.get(2..2 + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

fn load_roots(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| EndpointError::Tls(format!("failed to add CA cert: {e}")))?;
    }
    Ok(roots)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let f = File::open(path)
        .map_err(|e| EndpointError::Tls(format!("failed to open cert file {path}: {e}")))?;
    let mut reader = BufReader::new(f);
    let certs = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EndpointError::Tls(format!("failed to read certs from {path}: {e}")))?;
    if certs.is_empty() {
        return Err(EndpointError::Tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let f = File::open(path)
        .map_err(|e| EndpointError::Tls(format!("failed to open key file {path}: {e}")))?;
    let mut reader = BufReader::new(f);
    let mut pkcs8 = pkcs8_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EndpointError::Tls(format!("failed to read pkcs8 keys: {e}")))?;
    if let Some(k) = pkcs8.pop() {
        return Ok(PrivateKeyDer::from(k));
    }
    let f = File::open(path)
        .map_err(|e| EndpointError::Tls(format!("failed to open key file {path}: {e}")))?;
    let mut reader = BufReader::new(f);
    let mut rsa = rsa_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EndpointError::Tls(format!("failed to read rsa keys: {e}")))?;
    if let Some(k) = rsa.pop() {
        return Ok(PrivateKeyDer::from(k));
    }
    Err(EndpointError::NoPrivateKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_common_name_from_tlv() {
        // ... SET { SEQUENCE { OID 2.5.4.3, UTF8String "peer-7" } } ...
        let der = [
            0x31, 0x0f, 0x30, 0x0d, 0x06, 0x03, 0x55, 0x04, 0x03, 0x0c, 0x06, b'p', b'e',
            b'e', b'r', b'-', b'7',
        ];
        assert_eq!(extract_common_name(&der), Some("peer-7".to_string()));
    }

    #[test]
    fn test_extract_common_name_absent() {
        assert_eq!(extract_common_name(b"no oid here"), None);
        assert_eq!(extract_common_name(&[]), None);
    }
}
