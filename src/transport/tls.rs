//! TLS transport: length-prefix framing over a rustls-encrypted TCP stream.
//!
//! The client side dials TCP, then runs the rustls handshake (TLS 1.2 or
//! 1.3). Certificate validation policy is controlled by
//! [`TlsClientOptions::reject_unauthorized`]: when `false` any peer
//! certificate is accepted (self-signed development endpoints); when `true`
//! standard chain and hostname verification applies against the webpki
//! roots plus an optional extra CA file.
//!
//! The server side requires a certificate and key at construction; their
//! absence is a configuration error, not a runtime fault.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::tcp::tune_socket;
use super::{
    connect_with_backoff, ConnectionStatus, StreamCore, Transport,
};
use crate::codec::{Codec, MessagePackCodec};
use crate::defaults;
use crate::error::{Result, SbmError};
use crate::message::Message;

/// Client-side TLS policy.
#[derive(Debug, Clone)]
pub struct TlsClientOptions {
    /// Name presented for SNI and (when verifying) hostname checks.
    pub server_name: String,
    /// `true`: verify the peer chain and hostname. `false`: accept any
    /// certificate.
    pub reject_unauthorized: bool,
    /// Extra PEM CA bundle trusted in addition to the webpki roots.
    pub ca_file: Option<PathBuf>,
}

impl TlsClientOptions {
    /// Verifying options for `server_name`.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            reject_unauthorized: true,
            ca_file: None,
        }
    }

    /// Options accepting any peer certificate (development endpoints).
    pub fn insecure(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            reject_unauthorized: false,
            ca_file: None,
        }
    }
}

/// Server-side certificate material.
#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    /// PEM certificate chain.
    pub cert_file: PathBuf,
    /// PEM private key.
    pub key_file: PathBuf,
}

/// Certificate verifier that accepts everything. Installed only when the
/// caller explicitly opts out of verification.
#[derive(Debug)]
struct AcceptAnyCertificate(WebPkiSupportedAlgorithms);

impl AcceptAnyCertificate {
    fn new() -> Self {
        Self(
            rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Build the rustls client config for the given policy.
pub(crate) fn client_tls_config(options: &TlsClientOptions) -> Result<Arc<rustls::ClientConfig>> {
    let config = if options.reject_unauthorized {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &options.ca_file {
            let mut reader = BufReader::new(File::open(path)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert?;
                roots
                    .add(cert)
                    .map_err(|e| SbmError::Config(format!("invalid CA certificate: {e}")))?;
            }
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::new()))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Load the server certificate chain and key into a `TlsAcceptor`.
pub(crate) fn build_acceptor(options: &TlsServerOptions) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(File::open(&options.cert_file)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(SbmError::Config(
            "server certificate file contains no certificates".into(),
        ));
    }

    let mut key_reader = BufReader::new(File::open(&options.key_file)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| SbmError::Config("server key file contains no private key".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SbmError::Config(format!("invalid server certificate: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Length-prefix framed messaging over TLS.
pub struct TlsTransport {
    addr: String,
    options: TlsClientOptions,
    core: Arc<StreamCore>,
}

impl TlsTransport {
    /// Client-side transport dialing `addr` (`host:port`) with the
    /// reference codec and default frame ceiling.
    pub fn new(addr: impl Into<String>, options: TlsClientOptions) -> Self {
        Self::with_codec(
            addr,
            options,
            Arc::new(MessagePackCodec),
            defaults::MAX_FRAME_BYTES,
        )
    }

    /// Client-side transport with an explicit codec and frame ceiling.
    pub fn with_codec(
        addr: impl Into<String>,
        options: TlsClientOptions,
        codec: Arc<dyn Codec>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            addr: addr.into(),
            options,
            core: Arc::new(StreamCore::new(codec, max_frame_bytes)),
        }
    }

    /// Run the server-side handshake over an accepted TCP stream and wrap
    /// the encrypted stream. The transport starts out connected.
    pub async fn from_accepted(
        stream: TcpStream,
        acceptor: &TlsAcceptor,
        codec: Arc<dyn Codec>,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        tune_socket(&stream)?;
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());
        let tls = acceptor.accept(stream).await?;
        let core = Arc::new(StreamCore::new(codec, max_frame_bytes));
        let (reader, writer) = tokio::io::split(tls);
        core.install(Box::new(reader), Box::new(writer)).await;
        Ok(Self {
            addr,
            options: TlsClientOptions::new("<accepted>"),
            core,
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, max_retries: u32, base_delay: Duration) -> Result<()> {
        if self.core.is_connected() {
            return Ok(());
        }

        // Configuration problems surface before any dial attempt.
        let connector = TlsConnector::from(client_tls_config(&self.options)?);
        let server_name = ServerName::try_from(self.options.server_name.clone())
            .map_err(|e| SbmError::Config(format!("invalid TLS server name: {e}")))?;

        let dial_addr = self.addr.clone();
        let tls = connect_with_backoff(
            self.core.status_cell(),
            self.core.cancel_token(),
            self.core.has_had_session(),
            max_retries,
            base_delay,
            move || {
                let addr = dial_addr.clone();
                let connector = connector.clone();
                let server_name = server_name.clone();
                Box::pin(async move {
                    let tcp = TcpStream::connect(&addr).await?;
                    tune_socket(&tcp)?;
                    let tls = connector.connect(server_name, tcp).await?;
                    Ok(tls)
                })
            },
        )
        .await?;

        debug!(addr = %self.addr, "tls stream established");
        let (reader, writer) = tokio::io::split(tls);
        self.core.install(Box::new(reader), Box::new(writer)).await;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.core.send(message).await
    }

    fn receive(&self) -> Result<mpsc::Receiver<Message>> {
        self.core.begin_receive()
    }

    fn on_authenticating(&self) {
        self.core.status_cell().set(ConnectionStatus::Authenticating);
    }

    fn on_authenticated(&self) {
        self.core.status_cell().set(ConnectionStatus::Authenticated);
    }

    async fn close(&self) -> Result<()> {
        self.core.close().await;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.core.status_cell().get()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.core.status_cell().subscribe()
    }
}
