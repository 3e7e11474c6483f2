use crate::error::{ProxyError, Result};

use dashmap::DashMap;
use rcgen::{CertificateParams, DnType, KeyPair};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, ServerConfig};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::debug;

/// On-the-fly certificate mint. Leaf certificates are keyed by SNI and
/// signed by an in-process root CA; the `source_port -> SNI` map lets
/// the handler dial upstream as `SNI:port` over TLS. Everything is
/// instance state owned by the proxy.
pub struct TlsShim {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    cert_cache: DashMap<String, Arc<ServerConfig>>,
    sni_by_port: DashMap<u16, String>,
    connector: TlsConnector,
}

fn rcgen_err(e: rcgen::Error) -> ProxyError {
    ProxyError::TlsHandshake(e.to_string())
}

impl TlsShim {
    pub fn new() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Retrace Proxy CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Retrace");
        let ca_key = KeyPair::generate().map_err(rcgen_err)?;
        let ca_cert = params.self_signed(&ca_key).map_err(rcgen_err)?;

        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
            .with_no_client_auth();

        Ok(Self {
            ca_cert,
            ca_key,
            cert_cache: DashMap::new(),
            sni_by_port: DashMap::new(),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// TLS record type Handshake plus a 3.x version prefix.
    pub fn is_client_hello(peek: &[u8]) -> bool {
        peek.len() >= 3 && peek[0] == 0x16 && peek[1] == 0x03 && peek[2] <= 0x03
    }

    /// PEM of the root CA, for callers that install trust out-of-band.
    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn sni_for_port(&self, source_port: u16) -> Option<String> {
        self.sni_by_port.get(&source_port).map(|s| s.clone())
    }

    pub fn forget_port(&self, source_port: u16) {
        self.sni_by_port.remove(&source_port);
    }

    fn server_config_for(&self, sni: &str) -> Result<Arc<ServerConfig>> {
        if let Some(cached) = self.cert_cache.get(sni) {
            return Ok(Arc::clone(cached.value()));
        }
        let leaf_key = KeyPair::generate().map_err(rcgen_err)?;
        let params = CertificateParams::new(vec![sni.to_string()]).map_err(rcgen_err)?;
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(rcgen_err)?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone()], key_der)
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
        let config = Arc::new(config);
        self.cert_cache.insert(sni.to_string(), Arc::clone(&config));
        debug!("RetraceProxy minted leaf certificate for {sni}");
        Ok(config)
    }

    /// Terminate TLS on the client side with a leaf minted for the
    /// presented SNI, publishing `source_port -> SNI` on the way.
    pub async fn terminate(
        &self,
        stream: TcpStream,
        source_port: u16,
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = acceptor
            .await
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
        let sni = start
            .client_hello()
            .server_name()
            .unwrap_or("localhost")
            .to_string();
        self.sni_by_port.insert(source_port, sni.clone());
        let config = self.server_config_for(&sni)?;
        start
            .into_stream(config)
            .await
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))
    }

    /// Dial the upstream leg over TLS using the client's SNI, so the
    /// origin sees the name the application asked for.
    pub async fn upgrade_upstream(
        &self,
        server_name: &str,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ProxyError::TlsHandshake(format!("bad server name {server_name}")))?;
        self.connector
            .connect(name, tcp)
            .await
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))
    }
}

/// The upstream leg re-dials origins the application already chose to
/// trust; certificate verification is intentionally skipped there.
#[derive(Debug)]
struct NoVerify {
    provider: rustls::crypto::CryptoProvider,
}

impl NoVerify {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_detection() {
        assert!(TlsShim::is_client_hello(&[0x16, 0x03, 0x01, 0x02, 0x00]));
        assert!(TlsShim::is_client_hello(&[0x16, 0x03, 0x03, 0x00, 0x10]));
        assert!(!TlsShim::is_client_hello(&[0x16, 0x03, 0x04, 0x00, 0x10]));
        assert!(!TlsShim::is_client_hello(b"GET /"));
        assert!(!TlsShim::is_client_hello(&[0x16]));
    }

    #[test]
    fn cert_cache_is_keyed_by_sni() {
        let shim = TlsShim::new().unwrap();
        let first = shim.server_config_for("db.internal").unwrap();
        let second = shim.server_config_for("db.internal").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let other = shim.server_config_for("api.internal").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn sni_map_publish_and_forget() {
        let shim = TlsShim::new().unwrap();
        shim.sni_by_port.insert(40000, "svc.local".to_string());
        assert_eq!(shim.sni_for_port(40000).as_deref(), Some("svc.local"));
        shim.forget_port(40000);
        assert!(shim.sni_for_port(40000).is_none());
    }

    #[test]
    fn ca_pem_is_exportable() {
        let shim = TlsShim::new().unwrap();
        let pem = shim.ca_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }
}
