//! TCP frame transport.
//!
//! Two uses: loopback testing of the full stack, and accepting the
//! streams the anonymizing daemon forwards from the local hidden-service
//! port. The connector also keeps a route table mapping network addresses
//! to socket addresses so tests can dial logical addresses over loopback.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::CoreError;
use crate::protocol::message::WireMessage;
use crate::transport::{read_frame, write_frame, Acceptor, Connector, FrameTransport};

/// A frame transport over one TCP stream.
pub struct TcpTransport {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    peer_addr: String,
}

impl TcpTransport {
    /// Wrap an established stream, labeling it with the peer's logical
    /// address.
    pub fn new(stream: TcpStream, peer_addr: String) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            peer_addr,
        }
    }

    /// Connect to a socket address directly.
    pub async fn connect<A: ToSocketAddrs>(addr: A, peer_addr: String) -> Result<Self, CoreError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::TransportError(format!("connect failed: {}", e)))?;
        Ok(Self::new(stream, peer_addr))
    }
}

#[async_trait]
impl FrameTransport for TcpTransport {
    async fn send(&mut self, frame: &WireMessage) -> Result<(), CoreError> {
        write_frame(&mut self.writer, frame).await
    }

    async fn receive(&mut self) -> Result<WireMessage, CoreError> {
        read_frame(&mut self.reader).await
    }

    async fn close(&mut self) -> Result<(), CoreError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    fn peer_addr(&self) -> String {
        self.peer_addr.clone()
    }
}

/// Dials peers over plain TCP, resolving logical addresses through a
/// route table.
///
/// Without a matching route the address itself is dialed as a socket
/// address, which suits clearnet peers and tests that use socket
/// addresses directly.
#[derive(Default)]
pub struct TcpConnector {
    routes: Mutex<HashMap<String, String>>,
}

impl TcpConnector {
    /// Create a connector with an empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a logical peer address to a socket address.
    pub fn add_route(&self, address: &str, socket_addr: &str) {
        self.routes
            .lock()
            .expect("route table lock poisoned")
            .insert(address.to_string(), socket_addr.to_string());
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn FrameTransport>, CoreError> {
        let target = {
            let routes = self.routes.lock().expect("route table lock poisoned");
            routes.get(address).cloned()
        }
        .unwrap_or_else(|| address.to_string());

        let transport = TcpTransport::connect(target.as_str(), address.to_string()).await?;
        Ok(Box::new(transport))
    }
}

/// Accepts inbound TCP streams as frame transports.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind a listener.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, CoreError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::TransportError(format!("bind failed: {}", e)))?;
        Ok(Self { listener })
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, CoreError> {
        self.listener
            .local_addr()
            .map_err(|e| CoreError::TransportError(format!("local addr: {}", e)))
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Box<dyn FrameTransport>, CoreError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| CoreError::TransportError(format!("accept failed: {}", e)))?;
        // The logical peer address is only learned from the handshake;
        // until then the socket address is the best label available.
        Ok(Box::new(TcpTransport::new(stream, addr.to_string())))
    }
}
