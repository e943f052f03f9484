//! Raw streams, connectors and the open sequence.
//!
//! Opening a connection runs: connect (directly or through an HTTP
//! `CONNECT` proxy) → optional TLS → upgrade request → response, repeating
//! from the top for each redirect.

use crate::config::{ConnectionOptions, TransportConfig};
use crate::error::{NetworkErrorKind, TransportError, TransportResult};
use crate::handshake::{connect_request, HandshakeOutcome, HttpLogic, HttpResponse};
use crate::tls;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, warn};
use url::Url;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A boxed [`AsyncStream`].
pub type BoxedStream = Box<dyn AsyncStream>;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens raw byte streams to a host.
///
/// The production implementation is [`TcpConnector`]; tests substitute
/// in-memory streams.
pub trait Connector: Send + Sync {
    /// Connects to `host:port`.
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, TransportResult<BoxedStream>>;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector with a per-address connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(TransportConfig::default().connect_timeout)
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, TransportResult<BoxedStream>> {
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
                Ok(ip) => vec![SocketAddr::new(ip, port)],
                Err(_) => lookup_host((host, port))
                    .await
                    .map_err(|err| {
                        TransportError::network(NetworkErrorKind::DnsFailure, format!("{host}: {err}"))
                    })?
                    .collect(),
            };
            if addrs.is_empty() {
                return Err(TransportError::network(NetworkErrorKind::UnknownHost, host));
            }

            let mut last_error = None;
            for addr in addrs {
                match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => {
                        stream.set_nodelay(true)?;
                        debug!(%addr, "TCP connected");
                        return Ok(Box::new(stream) as BoxedStream);
                    }
                    Ok(Err(err)) => {
                        debug!(%addr, error = %err, "TCP connect failed");
                        last_error = Some(TransportError::Io(err));
                    }
                    Err(_) => {
                        last_error = Some(TransportError::network(
                            NetworkErrorKind::Timeout,
                            format!("connecting to {addr}"),
                        ));
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| TransportError::network(NetworkErrorKind::UnknownHost, host)))
        })
    }
}

/// An upgraded stream ready for the read and write loops.
pub(crate) struct Established {
    pub stream: BoxedStream,
    /// Bytes read past the response head; the first received data.
    pub leftover: Vec<u8>,
    /// Final target after redirects.
    pub url: Url,
    /// Cookies set by any response along the way.
    pub cookies: Vec<(String, String)>,
    /// Negotiated sub-protocol.
    pub protocol: Option<String>,
}

/// Runs the whole open sequence, following redirects.
pub(crate) async fn establish(
    connector: &dyn Connector,
    options: &ConnectionOptions,
) -> TransportResult<Established> {
    let mut logic = HttpLogic::new(options.url.clone(), options.max_redirects)?;
    loop {
        let mut stream = open_tunnel(connector, options, logic.host(), logic.port()).await?;
        if logic.is_tls() {
            stream = tls::upgrade(stream, logic.host(), options.pinned_certificate.as_deref()).await?;
        }

        let request = logic.upgrade_request(options);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let (response, leftover) = read_response(&mut stream).await?;
        debug!(url = %logic.url(), status = response.status, "handshake response");
        match logic.handle_response(&response) {
            HandshakeOutcome::Upgraded => {
                return Ok(Established {
                    stream,
                    leftover,
                    url: logic.url().clone(),
                    cookies: logic.received_cookies().to_vec(),
                    protocol: response.header("Sec-WebSocket-Protocol").map(str::to_string),
                })
            }
            HandshakeOutcome::Redirect => continue,
            HandshakeOutcome::Failed(err) => {
                warn!(url = %logic.url(), status = response.status, error = %err, "handshake failed");
                return Err(err);
            }
        }
    }
}

/// Connects to the target, tunnelling through the proxy when configured.
async fn open_tunnel(
    connector: &dyn Connector,
    options: &ConnectionOptions,
    host: &str,
    port: u16,
) -> TransportResult<BoxedStream> {
    let Some(proxy) = &options.proxy else {
        return connector.connect(host, port).await;
    };

    let mut stream = connector.connect(&proxy.host, proxy.port).await?;
    let request = connect_request(host, port, proxy.credentials.as_ref());
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (response, leftover) = read_response(&mut stream).await?;
    match response.status {
        200..=299 if leftover.is_empty() => {
            debug!(proxy = %proxy.host, target = host, "proxy tunnel open");
            Ok(stream)
        }
        200..=299 => Err(TransportError::network(
            NetworkErrorKind::ProxyFailed,
            "proxy sent data before the tunnel was used",
        )),
        407 => Err(TransportError::Http {
            status: 407,
            reason: response.reason,
        }),
        status => Err(TransportError::network(
            NetworkErrorKind::ProxyFailed,
            format!("proxy answered {status} {}", response.reason),
        )),
    }
}

/// Reads one response head; returns it with any bytes read past its end.
async fn read_response<S>(stream: &mut S) -> TransportResult<(HttpResponse, Vec<u8>)>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some((response, used)) = HttpResponse::parse(&buf)? {
            return Ok((response, buf.split_off(used)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use parking_lot::Mutex;
    use tokio::io::DuplexStream;

    /// Hands out pre-made duplex streams and records each target.
    struct ScriptedConnector {
        streams: Mutex<Vec<DuplexStream>>,
        targets: Mutex<Vec<(String, u16)>>,
    }

    impl Connector for ScriptedConnector {
        fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, TransportResult<BoxedStream>> {
            self.targets.lock().push((host.to_string(), port));
            let stream = self.streams.lock().pop();
            Box::pin(async move {
                stream
                    .map(|s| Box::new(s) as BoxedStream)
                    .ok_or_else(|| TransportError::network(NetworkErrorKind::HostUnreachable, "no stream"))
            })
        }
    }

    async fn read_head(server: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    fn key_of(request: &str) -> String {
        request
            .lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn establish_follows_redirect_and_keeps_leftover() {
        let (client1, mut server1) = tokio::io::duplex(4096);
        let (client2, mut server2) = tokio::io::duplex(4096);
        let connector = ScriptedConnector {
            // popped from the back
            streams: Mutex::new(vec![client2, client1]),
            targets: Mutex::new(Vec::new()),
        };

        tokio::spawn(async move {
            read_head(&mut server1).await;
            server1
                .write_all(b"HTTP/1.1 302 Found\r\nLocation: ws://second.example:5000/db\r\n\r\n")
                .await
                .unwrap();

            let request = read_head(&mut server2).await;
            let accept = crate::handshake::accept_key(&key_of(&request));
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {accept}\r\n\r\nhello"
            );
            server2.write_all(response.as_bytes()).await.unwrap();
            // keep the stream alive until the client is done
            let mut sink = Vec::new();
            let _ = server2.read_to_end(&mut sink).await;
        });

        let options = ConnectionOptions::new(Url::parse("ws://first.example/db").unwrap());
        let established = establish(&connector, &options).await.unwrap();

        assert_eq!(established.url.as_str(), "ws://second.example:5000/db");
        assert_eq!(established.leftover, b"hello");
        assert_eq!(
            *connector.targets.lock(),
            vec![("first.example".to_string(), 80), ("second.example".to_string(), 5000)]
        );
    }

    #[tokio::test]
    async fn proxy_tunnel_is_requested_first() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connector = ScriptedConnector {
            streams: Mutex::new(vec![client]),
            targets: Mutex::new(Vec::new()),
        };

        let server_task = tokio::spawn(async move {
            let connect = read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();
            let upgrade = read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
            (connect, upgrade)
        });

        let options = ConnectionOptions::new(Url::parse("ws://db.example:4984/db").unwrap())
            .with_proxy(ProxyConfig::new("proxy.local", 3128));
        let err = establish(&connector, &options).await.err().unwrap();
        assert!(matches!(err, TransportError::Http { status: 403, .. }));

        let (connect, upgrade) = server_task.await.unwrap();
        assert!(connect.starts_with("CONNECT db.example:4984 HTTP/1.1\r\n"));
        assert!(upgrade.starts_with("GET /db HTTP/1.1\r\n"));
        assert_eq!(*connector.targets.lock(), vec![("proxy.local".to_string(), 3128)]);
    }

    #[tokio::test]
    async fn proxy_auth_required() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connector = ScriptedConnector {
            streams: Mutex::new(vec![client]),
            targets: Mutex::new(Vec::new()),
        };
        tokio::spawn(async move {
            read_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let options = ConnectionOptions::new(Url::parse("ws://db.example/db").unwrap())
            .with_proxy(ProxyConfig::new("proxy.local", 3128));
        let err = establish(&connector, &options).await.err().unwrap();
        assert!(matches!(err, TransportError::Http { status: 407, .. }));
    }

    #[tokio::test]
    async fn eof_during_handshake() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);
        let connector = ScriptedConnector {
            streams: Mutex::new(vec![client]),
            targets: Mutex::new(Vec::new()),
        };
        let options = ConnectionOptions::new(Url::parse("ws://db.example/db").unwrap());
        let err = establish(&connector, &options).await.err().unwrap();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn ipv6_literal_target_reaches_connector_without_brackets() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connector = ScriptedConnector {
            streams: Mutex::new(vec![client]),
            targets: Mutex::new(Vec::new()),
        };
        tokio::spawn(async move {
            read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await.unwrap();
        });

        let options = ConnectionOptions::new(Url::parse("ws://[::1]:4984/db").unwrap());
        let err = establish(&connector, &options).await.err().unwrap();
        assert!(matches!(err, TransportError::Http { status: 404, .. }));
        assert_eq!(*connector.targets.lock(), vec![("::1".to_string(), 4984)]);
    }

    #[tokio::test]
    async fn tcp_connector_dials_ipv6_literal() {
        // Hosts without IPv6 loopback have nothing to test.
        let Ok(listener) = tokio::net::TcpListener::bind("[::1]:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(_, addr)| addr) });

        let logic = HttpLogic::new(Url::parse(&format!("ws://[::1]:{port}/db")).unwrap(), 10).unwrap();
        let connector = TcpConnector::default();
        assert!(connector.connect(logic.host(), logic.port()).await.is_ok());
        assert!(accept.await.unwrap().unwrap().is_ipv6());
    }

    #[tokio::test]
    async fn connector_failure_propagates() {
        let connector = ScriptedConnector {
            streams: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
        };
        let options = ConnectionOptions::new(Url::parse("ws://db.example/db").unwrap());
        let err = establish(&connector, &options).await.err().unwrap();
        assert!(matches!(
            err,
            TransportError::Network {
                kind: NetworkErrorKind::HostUnreachable,
                ..
            }
        ));
    }
}
