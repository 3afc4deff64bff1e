//! NNTP transport: TCP/TLS connection establishment and the wire verbs
//!
//! One [`NntpConnection`] speaks to one server socket. Commands are issued
//! strictly one at a time; BODY/ARTICLE leave the connection in a
//! data-reading state that the caller drains line by line via
//! [`read_data_line`](NntpConnection::read_data_line) until the dot
//! terminator.

use crate::client::ArticleHeaders;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::response::{NntpResponse, codes, parse_response_line};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, trace, warn};

/// TCP connection timeout in seconds
const TCP_CONNECT_TIMEOUT_SECS: u64 = 120;

/// TLS handshake timeout in seconds
const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 60;

/// BufReader capacity for high-throughput article downloads (256KB)
const BUFREADER_CAPACITY: usize = 256 * 1024;

/// Timeout for single status lines
const SINGLE_LINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for each data line of a multi-line response
const DATA_LINE_TIMEOUT: Duration = Duration::from_secs(180);

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Dangerous certificate verifier that accepts all certificates
///
/// **Security Warning:** disables all certificate validation. Only for
/// servers you trust on a secure network.
#[derive(Debug)]
struct DangerousAcceptAnyCertificate;

impl ServerCertVerifier for DangerousAcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

/// One live NNTP connection
pub struct NntpConnection {
    stream: BufReader<Pin<Box<dyn Transport>>>,
}

impl std::fmt::Debug for NntpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NntpConnection").finish_non_exhaustive()
    }
}

impl NntpConnection {
    /// Connect to the server and validate the greeting
    ///
    /// Does not authenticate — call [`authenticate`](Self::authenticate)
    /// after connecting.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] for TCP failures, [`Error::Tls`] for handshake
    /// failures, [`Error::Timeout`] when connect or handshake stall, and
    /// [`Error::Protocol`] when the server rejects the session.
    pub async fn connect(config: &ProviderConfig) -> Result<Self> {
        debug!("Connecting to NNTP server {}:{}", config.host, config.port);

        let tcp_stream = Self::open_socket(config).await?;

        let transport: Pin<Box<dyn Transport>> = if config.tls {
            Box::pin(Self::wrap_tls(config, tcp_stream).await?)
        } else {
            Box::pin(tcp_stream)
        };

        let mut conn = Self {
            stream: BufReader::with_capacity(BUFREADER_CAPACITY, transport),
        };

        let greeting = conn.read_response().await?;
        trace!("Server greeting: {} {}", greeting.code, greeting.message);
        match greeting.code {
            codes::READY_POSTING_ALLOWED | codes::READY_NO_POSTING => Ok(conn),
            code => Err(Error::Protocol {
                code,
                message: greeting.message,
            }),
        }
    }

    async fn open_socket(config: &ProviderConfig) -> Result<TcpStream> {
        use std::net::ToSocketAddrs;

        let addr = format!("{}:{}", config.host, config.port);
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Failed to resolve address: {}", e),
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "No address resolved",
                ))
            })?;

        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if socket_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Io)?;

        // Low-latency command turnaround plus a large receive buffer for
        // article data on high-latency links.
        socket.set_nodelay(true).map_err(Error::Io)?;
        const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            warn!("Failed to set receive buffer size: {}", e);
        }

        // socket2's connect is blocking; connect before flipping to
        // non-blocking mode.
        let tcp_stream = timeout(
            Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS),
            tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
                socket.connect(&socket_addr.into())?;
                socket.set_nonblocking(true)?;
                Ok(socket.into())
            }),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Io(std::io::Error::other(format!("Task join error: {}", e))))?
        .map_err(Error::Io)?;

        TcpStream::from_std(tcp_stream).map_err(Error::Io)
    }

    async fn wrap_tls(
        config: &ProviderConfig,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
        let _ = CryptoProvider::install_default(ring::default_provider());

        let tls_config = if config.allow_insecure_tls {
            warn!("TLS certificate validation disabled - connection vulnerable to MITM attacks");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(DangerousAcceptAnyCertificate))
                .with_no_client_auth()
        } else {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(config.host.as_str())
            .map_err(|e| Error::Tls(format!("Invalid domain: {}", e)))?
            .to_owned();

        timeout(
            Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS),
            connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Tls(format!("TLS handshake failed: {}", e)))
    }

    /// Authenticate with AUTHINFO USER/PASS (no-op for an empty username)
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() {
            return Ok(());
        }

        self.send_command(&format!("AUTHINFO USER {}\r\n", username))
            .await?;
        let resp = self.read_response().await?;
        match resp.code {
            codes::AUTH_ACCEPTED => return Ok(()),
            codes::AUTH_CONTINUE => {}
            _ => return Err(Error::AuthFailed(resp.message)),
        }

        self.send_command(&format!("AUTHINFO PASS {}\r\n", password))
            .await?;
        let resp = self.read_response().await?;
        match resp.code {
            codes::AUTH_ACCEPTED => Ok(()),
            _ => Err(Error::AuthFailed(resp.message)),
        }
    }

    /// STAT: check article existence without transferring data
    pub async fn stat(&mut self, message_id: &str) -> Result<()> {
        let id = format_message_id(message_id);
        self.send_command(&format!("STAT {}\r\n", id)).await?;
        let resp = self.read_response().await?;
        match resp.code {
            codes::ARTICLE_STAT => Ok(()),
            codes::NO_SUCH_ARTICLE_ID => Err(Error::NoSuchArticle(message_id.to_string())),
            code => Err(Error::Protocol {
                code,
                message: resp.message,
            }),
        }
    }

    /// HEAD: fetch article headers
    pub async fn head(&mut self, message_id: &str) -> Result<ArticleHeaders> {
        let id = format_message_id(message_id);
        self.send_command(&format!("HEAD {}\r\n", id)).await?;
        let resp = self.read_response().await?;
        match resp.code {
            codes::HEAD_FOLLOWS => {}
            codes::NO_SUCH_ARTICLE_ID => {
                return Err(Error::NoSuchArticle(message_id.to_string()));
            }
            code => {
                return Err(Error::Protocol {
                    code,
                    message: resp.message,
                });
            }
        }

        let mut lines = Vec::new();
        while let Some(line) = self.read_data_line().await? {
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(ArticleHeaders::from_lines(lines))
    }

    /// DATE: server time as UTC
    pub async fn date(&mut self) -> Result<DateTime<Utc>> {
        self.send_command("DATE\r\n").await?;
        let resp = self.read_response().await?;
        if resp.code != codes::SERVER_DATE {
            return Err(Error::Protocol {
                code: resp.code,
                message: resp.message,
            });
        }
        let stamp = resp
            .message
            .split_whitespace()
            .next()
            .unwrap_or_default();
        let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
            .map_err(|_| Error::InvalidResponse(format!("Bad DATE response: {}", resp.message)))?;
        Ok(naive.and_utc())
    }

    /// BODY: start an article body transfer
    ///
    /// On success the connection is in data state; drain it with
    /// [`read_data_line`](Self::read_data_line) until `None`.
    pub async fn body_start(&mut self, message_id: &str) -> Result<()> {
        let id = format_message_id(message_id);
        self.send_command(&format!("BODY {}\r\n", id)).await?;
        let resp = self.read_response().await?;
        match resp.code {
            codes::BODY_FOLLOWS => Ok(()),
            codes::NO_SUCH_ARTICLE_ID => Err(Error::NoSuchArticle(message_id.to_string())),
            code => Err(Error::Protocol {
                code,
                message: resp.message,
            }),
        }
    }

    /// ARTICLE: start a full article transfer, returning the parsed headers
    ///
    /// The header block is consumed here; the body lines that follow are
    /// drained via [`read_data_line`](Self::read_data_line) until `None`.
    pub async fn article_start(&mut self, message_id: &str) -> Result<ArticleHeaders> {
        let id = format_message_id(message_id);
        self.send_command(&format!("ARTICLE {}\r\n", id)).await?;
        let resp = self.read_response().await?;
        match resp.code {
            codes::ARTICLE_FOLLOWS => {}
            codes::NO_SUCH_ARTICLE_ID => {
                return Err(Error::NoSuchArticle(message_id.to_string()));
            }
            code => {
                return Err(Error::Protocol {
                    code,
                    message: resp.message,
                });
            }
        }

        // Headers run up to the first empty line; the body follows it.
        let mut lines = Vec::new();
        loop {
            match self.read_data_line().await? {
                None => break, // headers-only article
                Some(line) if line.is_empty() => break,
                Some(line) => lines.push(String::from_utf8_lossy(&line).into_owned()),
            }
        }
        Ok(ArticleHeaders::from_lines(lines))
    }

    /// Read one line of a multi-line response
    ///
    /// Returns `None` at the dot terminator. Dot-stuffing (`..` prefix) is
    /// undone; the trailing CRLF is stripped.
    pub async fn read_data_line(&mut self) -> Result<Option<Vec<u8>>> {
        let read_future = async {
            let mut line = Vec::with_capacity(1024);
            let n = self.stream.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                line.pop();
            }
            if line == b"." {
                return Ok(None);
            }
            if line.starts_with(b"..") {
                line.remove(0);
            }
            Ok(Some(line))
        };

        timeout(DATA_LINE_TIMEOUT, read_future)
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn send_command(&mut self, command: &str) -> Result<()> {
        trace!("Sending command: {}", command.trim());
        self.stream.get_mut().write_all(command.as_bytes()).await?;
        self.stream.get_mut().flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<NntpResponse> {
        let read_future = async {
            let mut line_bytes = Vec::with_capacity(512);
            let n = self.stream.read_until(b'\n', &mut line_bytes).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end();
            trace!("Received: {}", line);
            parse_response_line(line)
                .ok_or_else(|| Error::InvalidResponse(format!("Bad status line: {}", line)))
        };

        timeout(SINGLE_LINE_TIMEOUT, read_future)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// Message-ids on the wire carry angle brackets; NZB segment ids do not.
fn format_message_id(id: &str) -> String {
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{}>", id)
    }
}
