//! SOCKS5 connector for the anonymizing daemon's proxy.
//!
//! The daemon (Tor or compatible) exposes a SOCKS5 proxy; dialing a peer
//! means a standard CONNECT with domain addressing to its hidden-service
//! address. The core depends on the proxy only for routing and speaks
//! nothing beyond the RFC 1928 connect exchange: greeting, method
//! selection, request, reply. No authentication methods are offered.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::CoreError;
use crate::identity::normalize_address;
use crate::transport::{Connector, FrameTransport, TcpTransport};

/// Default SOCKS5 port of a locally running daemon.
pub const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:9050";

/// Port the peer's hidden service listens on for this protocol.
pub const DEFAULT_SERVICE_PORT: u16 = 8080;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;

/// Dials peers through a SOCKS5 proxy.
pub struct Socks5Connector {
    proxy_addr: String,
    service_port: u16,
}

impl Socks5Connector {
    /// Connector for a daemon at the default local proxy address.
    pub fn new() -> Self {
        Self {
            proxy_addr: DEFAULT_PROXY_ADDR.to_string(),
            service_port: DEFAULT_SERVICE_PORT,
        }
    }

    /// Connector for a daemon at a specific proxy address.
    pub fn with_proxy(proxy_addr: &str) -> Self {
        Self {
            proxy_addr: proxy_addr.to_string(),
            service_port: DEFAULT_SERVICE_PORT,
        }
    }

    /// Override the hidden-service port peers are dialed on.
    pub fn service_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    async fn negotiate(&self, stream: &mut TcpStream, host: &str) -> Result<(), CoreError> {
        // Greeting: we offer exactly one method, no authentication.
        stream
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
            return Err(CoreError::TransportError(
                "proxy refused no-auth method".into(),
            ));
        }

        // CONNECT with domain addressing.
        if host.len() > u8::MAX as usize {
            return Err(CoreError::InvalidAddress(format!(
                "host too long for SOCKS5: {}",
                host
            )));
        }
        let mut request = Vec::with_capacity(7 + host.len());
        request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&self.service_port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS_VERSION {
            return Err(CoreError::TransportError("proxy spoke wrong version".into()));
        }
        if reply[1] != 0x00 {
            return Err(CoreError::TransportError(format!(
                "proxy connect failed: {}",
                reply_error(reply[1])
            )));
        }

        // Drain the bound address, which this client never uses.
        match reply[3] {
            ATYP_IPV4 => {
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest).await?;
            }
            ATYP_IPV6 => {
                let mut rest = [0u8; 18];
                stream.read_exact(&mut rest).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await?;
            }
            other => {
                return Err(CoreError::TransportError(format!(
                    "proxy sent unknown address type {}",
                    other
                )));
            }
        }

        Ok(())
    }
}

impl Default for Socks5Connector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(&self, address: &str) -> Result<Box<dyn FrameTransport>, CoreError> {
        let address = normalize_address(address)?;

        let mut stream = TcpStream::connect(&self.proxy_addr)
            .await
            .map_err(|e| CoreError::TransportError(format!("proxy unreachable: {}", e)))?;

        self.negotiate(&mut stream, &address).await?;
        debug!(peer = %address, proxy = %self.proxy_addr, "SOCKS5 circuit open");

        Ok(Box::new(TcpTransport::new(stream, address)))
    }
}

fn reply_error(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::protocol::message::{generate_message_id, MessageType, WireMessage};
    use crate::transport::{read_frame, write_frame};
    use tokio::net::TcpListener;

    /// Minimal in-test SOCKS5 proxy: negotiates, then echoes one frame.
    async fn spawn_echo_proxy(expect_host: String) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut host = vec![0u8; head[4] as usize];
            stream.read_exact(&mut host).await.unwrap();
            assert_eq!(String::from_utf8(host).unwrap(), expect_host);
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();

            // Success reply with a zero IPv4 bind address.
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let frame = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &frame).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_and_echo_through_proxy() {
        let peer = Identity::create().unwrap();
        let proxy_addr = spawn_echo_proxy(peer.address().to_string()).await;

        let connector = Socks5Connector::with_proxy(&proxy_addr.to_string());
        let mut transport = connector.connect(peer.address()).await.unwrap();
        assert_eq!(transport.peer_addr(), peer.address());

        let frame = WireMessage::sealed(
            generate_message_id(),
            MessageType::Text,
            "sender.onion".to_string(),
            "Y29udGVudA==".to_string(),
            3,
        );
        transport.send(&frame).await.unwrap();

        let echoed = transport.receive().await.unwrap();
        assert_eq!(echoed.id, frame.id);
        assert_eq!(echoed.sequence, 3);
    }

    #[tokio::test]
    async fn test_proxy_refusal_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();

            // Host unreachable.
            stream
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let peer = Identity::create().unwrap();
        let connector = Socks5Connector::with_proxy(&addr.to_string());
        let result = connector.connect(peer.address()).await;
        assert!(matches!(result, Err(CoreError::TransportError(_))));
    }

    #[tokio::test]
    async fn test_invalid_address_rejected_before_dialing() {
        let connector = Socks5Connector::with_proxy("127.0.0.1:1");
        let result = connector.connect("definitely not an onion").await;
        assert!(matches!(result, Err(CoreError::InvalidAddress(_))));
    }
}
