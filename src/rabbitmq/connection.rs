use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use lapin::tcp::{HandshakeError, OwnedTLSConfig, RustlsConnector, TcpStream};
use lapin::uri::AMQPUri;
use lapin::{Connection, ConnectionProperties};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::{info, warn};
use url::form_urlencoded;

use super::amqp_client::AmqpConnection;
use super::errors::{BrokerError, Result};

pub const DEFAULT_PORT: u16 = 5672;

/// How the transport to the broker is secured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Disabled,
    Enabled {
        skip_verify: bool,
        /// PEM bundle added to the trust chain.
        ca_cert: Option<PathBuf>,
    },
}

impl TlsMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, TlsMode::Enabled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
}

impl ConnectionSettings {
    /// Connection URI with the password form-encoded.
    pub fn uri(&self) -> String {
        self.build_uri(&encode_password(&self.password))
    }

    /// Same as [`uri`](Self::uri) with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        self.build_uri("****")
    }

    fn scheme(&self) -> &'static str {
        if self.tls.is_enabled() {
            "amqps"
        } else {
            "amqp"
        }
    }

    fn build_uri(&self, password: &str) -> String {
        format!(
            "{}://{}:{}@{}:{}",
            self.scheme(),
            self.user,
            password,
            self.host,
            self.port
        )
    }
}

fn encode_password(password: &str) -> String {
    form_urlencoded::byte_serialize(password.as_bytes()).collect()
}

/// Owns the single broker connection of the process.
pub struct ConnectionManager;

impl ConnectionManager {
    /// Dial the broker once. There is no retry here: an unreachable broker at
    /// startup is a deployment error and the caller is expected to exit.
    pub async fn connect(settings: &ConnectionSettings) -> Result<AmqpConnection> {
        let uri = settings.uri();
        info!(
            uri = %settings.redacted_uri(),
            tls = settings.tls.is_enabled(),
            "Connecting to RabbitMQ"
        );

        let properties =
            ConnectionProperties::default().with_connection_name("timeseries-worker".into());

        let connection = match tls_config(&settings.tls)? {
            TlsSetup::Default => Connection::connect(&uri, properties).await,
            TlsSetup::CaBundle(config) => {
                Connection::connect_with_config(&uri, properties, config).await
            }
            TlsSetup::SkipVerify(connector) => {
                let amqp_uri = uri.parse::<AMQPUri>().map_err(BrokerError::ConnectionError)?;
                let host = settings.host.clone();
                let port = settings.port;
                Connection::connector(
                    amqp_uri,
                    Box::new(move |_: &AMQPUri| {
                        TcpStream::connect((host.as_str(), port))
                            .map_err(HandshakeError::Failure)?
                            .into_rustls(&connector, &host)
                    }),
                    properties,
                )
                .await
            }
        }
        .map_err(|e| BrokerError::ConnectionError(format!("Failed to connect: {}", e)))?;

        info!("Successfully connected to RabbitMQ");
        Ok(AmqpConnection::new(connection))
    }
}

/// How the TCP stream to the broker is set up.
pub enum TlsSetup {
    /// Plain TCP, or TLS verified against the system roots.
    Default,
    /// TLS verified against a configured CA bundle.
    CaBundle(OwnedTLSConfig),
    /// TLS that accepts any server certificate.
    SkipVerify(RustlsConnector),
}

/// Resolve the transport for `mode`. Skipping verification wins over a CA
/// bundle.
pub fn tls_config(mode: &TlsMode) -> Result<TlsSetup> {
    match mode {
        TlsMode::Disabled => Ok(TlsSetup::Default),
        TlsMode::Enabled {
            skip_verify: true,
            ca_cert,
        } => {
            warn!(
                ca_cert = ?ca_cert.as_ref().map(|path| path.display().to_string()),
                "TLS certificate verification is disabled"
            );
            accept_any_certificate().map(TlsSetup::SkipVerify)
        }
        TlsMode::Enabled {
            skip_verify: false,
            ca_cert: Some(path),
        } => {
            let cert_chain = fs::read_to_string(path).map_err(|e| {
                BrokerError::TlsError(format!(
                    "Failed to read CA bundle at {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Ok(TlsSetup::CaBundle(OwnedTLSConfig {
                identity: None,
                cert_chain: Some(cert_chain),
            }))
        }
        TlsMode::Enabled {
            skip_verify: false,
            ca_cert: None,
        } => Ok(TlsSetup::Default),
    }
}

fn accept_any_certificate() -> Result<RustlsConnector> {
    let provider = Arc::new(crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| BrokerError::TlsError(format!("Failed to build TLS config: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(RustlsConnector::from(config))
}

/// Trusts every server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
