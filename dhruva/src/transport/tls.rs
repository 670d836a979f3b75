//! SIP over TLS.
//!
//! The handshake runs on an accepted or connected TCP socket, then the
//! session is handed to a [`StreamTransport`]. Peer certificates are checked
//! by the WebPKI verifiers of `rustls` and then by the [`RevocationChecker`].

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use tokio::net::TcpStream;
use tokio_rustls::{server, TlsAcceptor, TlsConnector};

use super::revocation::RevocationChecker;
use super::tcp::StreamTransport;
use super::{Transport, TransportTx, TransportType};
use crate::config::{ClientAuth, TlsConfig};
use crate::error::{Error, Result};

/// Certificates, keys and verifiers shared by every TLS connection.
pub struct TlsContext {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
    roots: Option<Arc<RootCertStore>>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    client_auth: ClientAuth,
    checker: Arc<RevocationChecker>,
    connector: Option<TlsConnector>,
    handshake_timeout: Duration,
}

impl TlsContext {
    pub fn new(config: &TlsConfig, checker: Arc<RevocationChecker>) -> Result<Self> {
        let provider = Arc::new(crypto_provider(&config.cipher_suites)?);
        let versions = protocol_versions(&config.protocols)?;

        let roots = match &config.trust_store {
            Some(path) => Some(Arc::new(load_roots(path)?)),
            None => None,
        };
        let cert_chain = match &config.certificate {
            Some(path) => load_certs(path)?,
            None => Vec::new(),
        };
        let key = match &config.private_key {
            Some(path) => Some(load_key(path)?),
            None => None,
        };

        let mut context = Self {
            provider,
            versions,
            roots,
            cert_chain,
            key,
            client_auth: config.client_auth,
            checker,
            connector: None,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
        };
        context.connector = context.client_config()?.map(|c| TlsConnector::from(Arc::new(c)));

        Ok(context)
    }

    fn client_config(&self) -> Result<Option<ClientConfig>> {
        let Some(roots) = &self.roots else {
            log::debug!("No TLS trust store, outbound TLS disabled");
            return Ok(None);
        };
        let webpki = WebPkiServerVerifier::builder_with_provider(roots.clone(), self.provider.clone())
            .build()
            .map_err(|err| Error::Tls(err.to_string()))?;
        let verifier = Arc::new(RevocationServerVerifier {
            inner: webpki,
            checker: self.checker.clone(),
        });

        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)?
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        let config = match &self.key {
            Some(key) if !self.cert_chain.is_empty() => {
                builder.with_client_auth_cert(self.cert_chain.clone(), key.clone_key())?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Some(config))
    }

    /// The handshake of a listen point, `client_auth` overriding the
    /// configured policy.
    pub fn server(&self, client_auth: Option<ClientAuth>) -> Result<ServerHandshake> {
        let key = match &self.key {
            Some(key) if !self.cert_chain.is_empty() => key.clone_key(),
            _ => return Err(Error::Config("TLS listen point requires certificate and private_key".into())),
        };

        let builder = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)?;
        let builder = match client_auth.unwrap_or(self.client_auth) {
            ClientAuth::None => builder.with_no_client_auth(),
            auth => {
                let roots = self
                    .roots
                    .clone()
                    .ok_or_else(|| Error::Config("client authentication requires a trust_store".into()))?;
                let mut webpki = WebPkiClientVerifier::builder_with_provider(roots, self.provider.clone());
                if auth == ClientAuth::Optional {
                    webpki = webpki.allow_unauthenticated();
                }
                let inner = webpki.build().map_err(|err| Error::Tls(err.to_string()))?;
                builder.with_client_cert_verifier(Arc::new(RevocationClientVerifier {
                    inner,
                    checker: self.checker.clone(),
                }))
            }
        };
        let config = builder.with_single_cert(self.cert_chain.clone(), key)?;

        Ok(ServerHandshake {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            timeout: self.handshake_timeout,
        })
    }

    /// Opens a TLS connection to `addr`.
    ///
    /// The peer certificate is checked against `server_name`, or against the
    /// IP address when no name is known.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: Option<&str>,
        max_frame_size: usize,
        events: TransportTx,
    ) -> Result<Transport> {
        let connector = self
            .connector
            .clone()
            .ok_or_else(|| Error::Tls("outbound TLS requires a trust_store".into()))?;
        let name = match server_name {
            Some(name) => ServerName::try_from(name.trim_end_matches('.').to_string())
                .map_err(|err| Error::Tls(err.to_string()))?,
            None => ServerName::from(addr.ip()),
        };

        let stream = TcpStream::connect(addr).await?;
        let local = stream.local_addr()?;
        let stream = match tokio::time::timeout(self.handshake_timeout, connector.connect(name, stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(Error::Tls(format!("handshake with {addr} failed: {err}"))),
            Err(_) => return Err(Error::Tls(format!("handshake with {addr} timed out"))),
        };
        log::debug!("TLS connection to {} established", addr);

        StreamTransport::start(stream, TransportType::Tls, local, addr, max_frame_size, events).await
    }
}

/// Server side of the handshake, cloned for every accepted connection.
#[derive(Clone)]
pub struct ServerHandshake {
    acceptor: TlsAcceptor,
    timeout: Duration,
}

impl ServerHandshake {
    pub async fn accept(&self, stream: TcpStream) -> Result<server::TlsStream<TcpStream>> {
        let peer = stream.peer_addr()?;
        match tokio::time::timeout(self.timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(Error::Tls(format!("handshake with {peer} failed: {err}"))),
            Err(_) => Err(Error::Tls(format!("handshake with {peer} timed out"))),
        }
    }
}

#[derive(Debug)]
struct RevocationClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    checker: Arc<RevocationChecker>,
}

impl ClientCertVerifier for RevocationClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        self.checker.check_der(end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[derive(Debug)]
struct RevocationServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    checker: Arc<RevocationChecker>,
}

impl ServerCertVerifier for RevocationServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        self.checker.check_der(end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// The ring provider, restricted to `names` when not empty.
fn crypto_provider(names: &[String]) -> Result<CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    if names.is_empty() {
        return Ok(provider);
    }

    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        names.iter().any(|wanted| wanted.eq_ignore_ascii_case(&name))
    });
    if provider.cipher_suites.is_empty() {
        return Err(Error::Config(format!("no supported cipher suite in {names:?}")));
    }

    Ok(provider)
}

fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>> {
    let mut versions = Vec::with_capacity(names.len());
    for name in names {
        let version = match name.as_str() {
            "TLSv1.2" => &rustls::version::TLS12,
            "TLSv1.3" => &rustls::version::TLS13,
            other => return Err(Error::Config(format!("unsupported TLS protocol '{other}'"))),
        };
        versions.push(version);
    }
    if versions.is_empty() {
        versions.extend_from_slice(rustls::DEFAULT_VERSIONS);
    }

    Ok(versions)
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|err| Error::Config(format!("cannot open '{}': {}", path.display(), err)))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificate in '{}'", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)?
        .ok_or_else(|| Error::Config(format!("no private key in '{}'", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::revocation::{RevocationCache, RevocationPolicy};
    use crate::transport::tcp::TcpServer;
    use crate::transport::TransportEvent;

    struct Material {
        dir: PathBuf,
        der: Vec<u8>,
    }

    impl Drop for Material {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn material() -> Material {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("dhruva-tls-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cert.pem"), cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(dir.join("key.pem"), cert.serialize_private_key_pem()).unwrap();

        Material {
            dir,
            der: cert.serialize_der().unwrap(),
        }
    }

    fn config(material: &Material) -> TlsConfig {
        TlsConfig {
            certificate: Some(material.dir.join("cert.pem")),
            private_key: Some(material.dir.join("key.pem")),
            trust_store: Some(material.dir.join("cert.pem")),
            client_auth: ClientAuth::None,
            ..TlsConfig::default()
        }
    }

    fn checker(policy: RevocationPolicy) -> Arc<RevocationChecker> {
        Arc::new(RevocationChecker::new(Arc::new(RevocationCache::default()), policy))
    }

    #[test]
    fn test_rejects_unknown_protocol_and_suites() {
        assert!(protocol_versions(&["SSLv3".to_string()]).is_err());
        assert_eq!(protocol_versions(&[]).unwrap().len(), rustls::DEFAULT_VERSIONS.len());
        assert!(crypto_provider(&["TLS_NOPE".to_string()]).is_err());

        let provider = crypto_provider(&["TLS13_AES_128_GCM_SHA256".to_string()]).unwrap();
        assert_eq!(provider.cipher_suites.len(), 1);
    }

    #[test]
    fn test_client_auth_requires_trust_store() {
        let material = material();
        let config = TlsConfig {
            trust_store: None,
            ..config(&material)
        };
        let context = TlsContext::new(&config, checker(RevocationPolicy::SoftFail)).unwrap();

        assert!(context.server(Some(ClientAuth::Required)).is_err());
        assert!(context.server(Some(ClientAuth::None)).is_ok());
    }

    #[tokio::test]
    async fn test_handshake_and_message() {
        let material = material();
        let context = TlsContext::new(&config(&material), checker(RevocationPolicy::SoftFail)).unwrap();
        let (server_tx, mut server_rx) = mpsc::channel(4);
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(Some(context.server(None).unwrap()), 4096, server_tx));

        let (client_tx, _client_rx) = mpsc::channel(4);
        let client = context
            .connect(addr, Some("localhost"), 4096, client_tx)
            .await
            .unwrap();
        client.send(b"OPTIONS sip:a@b SIP/2.0\r\nl: 0\r\n\r\n", &addr).await.unwrap();

        assert_matches!(server_rx.recv().await, Some(TransportEvent::Created(t)) if t.is_secure());
        assert_matches!(
            server_rx.recv().await,
            Some(TransportEvent::Received(incoming)) if incoming.packet.data.starts_with(b"OPTIONS")
        );
    }

    #[tokio::test]
    async fn test_hard_fail_rejects_revoked_server() {
        let material = material();
        let checker = checker(RevocationPolicy::HardFail);
        let (issuer, serial) = crate::transport::revocation::certificate_identity(&material.der).unwrap();
        checker.cache().update(&issuer, &[serial]);
        let context = TlsContext::new(&config(&material), checker).unwrap();

        let (server_tx, _server_rx) = mpsc::channel(4);
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(Some(context.server(None).unwrap()), 4096, server_tx));

        let (client_tx, _client_rx) = mpsc::channel(4);
        let result = context.connect(addr, Some("localhost"), 4096, client_tx).await;

        assert_matches!(result, Err(Error::Tls(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let material = material();
        let context = TlsContext::new(&config(&material), checker(RevocationPolicy::SoftFail)).unwrap();
        let handshake = context.server(None).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _silent = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        assert_matches!(handshake.accept(stream).await, Err(Error::Tls(msg)) if msg.contains("timed out"));
    }
}
