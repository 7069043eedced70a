//! TLS contexts and the handshake dispatcher.
//!
//! [`ServerTls`] wraps accepted sockets; [`ClientTls`] wraps dialled ones.
//! Both are built from PEM material, use the `ring` crypto provider and
//! accept the provider's safe default protocol versions. A server context
//! configured with a CA requires client certificates signed by it.

use std::{
    fmt,
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use mio::net::TcpStream;
use rustls::{
    ClientConfig,
    ClientConnection,
    RootCertStore,
    ServerConfig,
    ServerConnection,
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject},
    server::WebPkiClientVerifier,
};
use thiserror::Error;

use crate::stream::Stream;

mod handshake;
mod stream;

pub use handshake::{Continuation, HandshakeState, TlsHandshake};
pub use stream::TlsStream;

/// Default time allowed for a handshake to complete.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors building a TLS context or starting a session.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// PEM data could not be decoded.
    #[error("invalid PEM {what}: {source}")]
    Pem {
        /// What was being parsed.
        what: &'static str,
        /// Underlying error.
        #[source]
        source: rustls::pki_types::pem::Error,
    },

    /// PEM data decoded but held no certificate.
    #[error("no certificates found in {0}")]
    NoCertificates(&'static str),

    /// rustls rejected the configuration or session.
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// The expected server name is not a valid DNS name or IP address.
    #[error("invalid server name: {0:?}")]
    ServerName(String),
}

fn provider() -> Arc<CryptoProvider> { Arc::new(ring::default_provider()) }

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certificates(
    pem: &[u8],
    what: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem { what, source })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem).map_err(|source| TlsError::Pem {
        what: "private key",
        source,
    })
}

fn root_store(ca_pem: &[u8]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ca_pem, "CA bundle")? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server-side TLS context shared by every accepted connection.
#[derive(Clone)]
pub struct ServerTls {
    config: Arc<ServerConfig>,
    handshake_timeout: Duration,
}

impl fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTls")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl ServerTls {
    /// Build a context from PEM certificate chain, key and optional CA
    /// bundle for client authentication.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if any PEM block is invalid or rustls rejects
    /// the key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: Option<&[u8]>) -> Result<Self, TlsError> {
        let certs = parse_certificates(cert_pem, "certificate chain")?;
        let key = parse_private_key(key_pem)?;
        let builder =
            ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
        let config = match ca_pem {
            Some(ca) => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca)?), provider())
                        .build()?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };
        Ok(Self::from_config(Arc::new(config)))
    }

    /// Build a context from PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if a file cannot be read or parsed.
    pub fn from_files(cert: &Path, key: &Path, ca: Option<&Path>) -> Result<Self, TlsError> {
        let ca = ca.map(read_pem).transpose()?;
        Self::from_pem(&read_pem(cert)?, &read_pem(key)?, ca.as_deref())
    }

    /// Use an existing rustls configuration.
    #[must_use]
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Time allowed for each handshake.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration { self.handshake_timeout }

    /// Start a server session over an accepted socket.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Rustls`] if the session cannot be created.
    pub fn accept(&self, socket: TcpStream) -> Result<Stream, TlsError> {
        let conn = ServerConnection::new(Arc::clone(&self.config))?;
        Ok(TlsStream::new(socket, conn).into())
    }
}

/// Client-side TLS context for dialled connections.
#[derive(Clone)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    handshake_timeout: Duration,
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl ClientTls {
    /// Build a context trusting `ca_pem`, expecting the server to present a
    /// certificate for `server_name`, and optionally authenticating with a
    /// PEM certificate chain and key.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if PEM data is invalid or `server_name` is not a
    /// valid name.
    pub fn from_pem(
        ca_pem: &[u8],
        server_name: &str,
        identity: Option<(&[u8], &[u8])>,
    ) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsError::ServerName(server_name.to_owned()))?;
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(root_store(ca_pem)?);
        let config = match identity {
            Some((cert_pem, key_pem)) => builder.with_client_auth_cert(
                parse_certificates(cert_pem, "certificate chain")?,
                parse_private_key(key_pem)?,
            )?,
            None => builder.with_no_client_auth(),
        };
        Ok(Self {
            config: Arc::new(config),
            server_name,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Build a context from PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if a file cannot be read or parsed.
    pub fn from_files(
        ca: &Path,
        server_name: &str,
        identity: Option<(&Path, &Path)>,
    ) -> Result<Self, TlsError> {
        let identity = identity
            .map(|(cert, key)| Ok::<_, TlsError>((read_pem(cert)?, read_pem(key)?)))
            .transpose()?;
        Self::from_pem(
            &read_pem(ca)?,
            server_name,
            identity
                .as_ref()
                .map(|(cert, key)| (cert.as_slice(), key.as_slice())),
        )
    }

    /// Override the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Time allowed for each handshake.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration { self.handshake_timeout }

    /// Start a client session over a connected socket.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Rustls`] if the session cannot be created.
    pub fn connect(&self, socket: TcpStream) -> Result<Stream, TlsError> {
        let conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())?;
        Ok(TlsStream::new(socket, conn).into())
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread, time::Duration};

    use rcgen::{CertificateParams, KeyPair};
    use rstest::rstest;

    use super::*;
    use crate::stream::ReadOutcome;

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let key = KeyPair::generate().expect("key");
        let cert = CertificateParams::new(vec!["localhost".to_owned()])
            .expect("params")
            .self_signed(&key)
            .expect("self-sign");
        (cert.pem().into_bytes(), key.serialize_pem().into_bytes())
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = std::net::TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        for socket in [&client, &server] {
            socket.set_nonblocking(true).expect("non-blocking");
        }
        (TcpStream::from_std(client), TcpStream::from_std(server))
    }

    fn drive(stream: &mut Stream) -> bool {
        match stream {
            Stream::Tls(tls) => tls.drive_handshake().expect("handshake step"),
            Stream::Plain(_) => true,
        }
    }

    #[rstest]
    #[case::empty(b"".as_slice())]
    #[case::not_pem(b"certificate".as_slice())]
    fn missing_certificates_are_reported(#[case] pem: &[u8]) {
        let (_, key) = self_signed();
        let err = ServerTls::from_pem(pem, &key, None).expect_err("no certificate");
        assert!(matches!(err, TlsError::NoCertificates(_)), "{err}");
    }

    #[test]
    fn invalid_server_names_are_rejected() {
        let (cert, _) = self_signed();
        let err = ClientTls::from_pem(&cert, "not a host name", None).expect_err("bad name");
        assert!(matches!(err, TlsError::ServerName(_)), "{err}");
    }

    #[test]
    fn unreadable_files_name_the_path() {
        let err = ServerTls::from_files(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"), None)
            .expect_err("missing file");
        assert!(err.to_string().contains("/nonexistent/cert.pem"), "{err}");
    }

    #[test]
    fn sessions_handshake_and_exchange_data() {
        let (cert, key) = self_signed();
        let server_tls = ServerTls::from_pem(&cert, &key, None)
            .expect("server tls")
            .with_handshake_timeout(Duration::from_secs(2));
        assert_eq!(server_tls.handshake_timeout(), Duration::from_secs(2));
        let client_tls = ClientTls::from_pem(&cert, "localhost", None).expect("client tls");

        let (client_socket, server_socket) = socket_pair();
        let mut client = client_tls.connect(client_socket).expect("client session");
        let mut server = server_tls.accept(server_socket).expect("server session");
        assert!(client.is_tls() && client.is_handshaking());

        let mut done = (false, false);
        for _ in 0..500 {
            done = (drive(&mut client), drive(&mut server));
            if done == (true, true) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(done, (true, true), "handshake never completed");

        assert_eq!(client.write(b"hello").expect("write"), 5);
        let mut buf = [0_u8; 5];
        for _ in 0..500 {
            if let ReadOutcome::Data(5) = server.peek(&mut buf) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(&buf, b"hello");
    }
}
