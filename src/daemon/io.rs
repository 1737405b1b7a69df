//! Device I/O
//!
//! Control-link transports and capture storage.

use crate::{MctError, Result};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};

/// I/O statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total messages sent
    pub packets_sent: u64,
    /// Total messages received
    pub packets_received: u64,
    /// Number of send errors
    pub send_errors: u64,
    /// Number of receive errors
    pub recv_errors: u64,
}

/// Control-link transport
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Next inbound message; `None` once the link is closed
    async fn recv(&self) -> Option<Bytes>;

    /// Send a response or chunk
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Send on the status channel
    async fn notify(&self, data: &[u8]) -> Result<()> {
        self.send(data).await
    }

    fn name(&self) -> &str;
}

/// In-memory transport, paired with a [`ControllerLink`]
#[derive(Debug)]
pub struct ChannelTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    replies: mpsc::UnboundedSender<Vec<u8>>,
    notifications: mpsc::UnboundedSender<Vec<u8>>,
}

/// Controller side of a [`ChannelTransport`]
#[derive(Debug)]
pub struct ControllerLink {
    commands: mpsc::UnboundedSender<Bytes>,
    replies: mpsc::UnboundedReceiver<Vec<u8>>,
    notifications: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ControllerLink) {
        let (commands, inbound) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        (
            Self {
                inbound: Mutex::new(inbound),
                replies: replies_tx,
                notifications: notify_tx,
            },
            ControllerLink {
                commands,
                replies: replies_rx,
                notifications: notify_rx,
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.replies
            .send(data.to_vec())
            .map_err(|_| MctError::Transport("Controller disconnected".to_string()))
    }

    async fn notify(&self, data: &[u8]) -> Result<()> {
        self.notifications
            .send(data.to_vec())
            .map_err(|_| MctError::Transport("Controller disconnected".to_string()))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

impl ControllerLink {
    pub fn send_raw(&self, data: impl Into<Bytes>) -> Result<()> {
        self.commands
            .send(data.into())
            .map_err(|_| MctError::Transport("Device disconnected".to_string()))
    }

    pub fn send_command(&self, command: &serde_json::Value) -> Result<()> {
        self.send_raw(serde_json::to_vec(command)?)
    }

    pub async fn next_reply(&mut self) -> Option<serde_json::Value> {
        let bytes = self.replies.recv().await?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn next_notification(&mut self) -> Option<serde_json::Value> {
        let bytes = self.notifications.recv().await?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Close the command direction
    pub fn close(self) -> (mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        (self.replies, self.notifications)
    }
}

/// UDP datagram transport. Replies go to the most recent sender.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: RwLock<Option<SocketAddr>>,
    stats: RwLock<IoStats>,
    buffer_size: usize,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr, buffer_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            MctError::Transport(format!("Failed to bind UDP socket on {}: {}", addr, e))
        })?;
        log::info!("UDP transport listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            peer: RwLock::new(None),
            stats: RwLock::new(IoStats::default()),
            buffer_size: buffer_size.max(64),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().await
    }

    pub async fn get_stats(&self) -> IoStats {
        self.stats.read().await.clone()
    }

    async fn send_to_peer(&self, data: &[u8]) -> Result<()> {
        let peer = self
            .peer()
            .await
            .ok_or_else(|| MctError::Transport("No controller connected".to_string()))?;

        match self.socket.send_to(data, peer).await {
            Ok(sent) => {
                let mut stats = self.stats.write().await;
                stats.bytes_sent += sent as u64;
                stats.packets_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.write().await.send_errors += 1;
                Err(MctError::Transport(format!("UDP send to {} failed: {}", peer, e)))
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn recv(&self) -> Option<Bytes> {
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    {
                        let mut stats = self.stats.write().await;
                        stats.bytes_received += size as u64;
                        stats.packets_received += 1;
                    }

                    let mut peer = self.peer.write().await;
                    if *peer != Some(source) {
                        log::info!("Controller connected from {}", source);
                        *peer = Some(source);
                    }
                    return Some(Bytes::copy_from_slice(&buffer[..size]));
                }
                Err(e) => {
                    log::error!("UDP receive error: {}", e);
                    self.stats.write().await.recv_errors += 1;
                }
            }
        }
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_to_peer(data).await
    }

    fn name(&self) -> &str {
        "udp"
    }
}

/// Byte-stream storage for capture files
pub trait Storage: Send + Sync {
    /// Create (or truncate) `path` and return a writable sink
    fn open_sink(&self, path: &str) -> Result<Box<dyn Write + Send>>;

    fn exists(&self, path: &str) -> bool;

    /// Delete `path`; missing files are not an error
    fn remove(&self, path: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Filesystem storage confined under a root directory
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            MctError::Storage(format!("Failed to create {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a device path onto the root. Leading slashes are ignored; parent
    /// components are rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        let mut depth = 0;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => {
                    return Err(MctError::Storage(format!("Invalid path '{}'", path)));
                }
            }
        }

        if depth == 0 {
            return Err(MctError::Storage(format!("Invalid path '{}'", path)));
        }
        Ok(resolved)
    }
}

impl Storage for FsStorage {
    fn open_sink(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&resolved).map_err(|e| {
            MctError::Storage(format!("Failed to create {}: {}", resolved.display(), e))
        })?;
        log::debug!("Opened {}", resolved.display());
        Ok(Box::new(file))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn remove(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        match fs::remove_file(&resolved) {
            Ok(()) => {
                log::debug!("Removed {}", resolved.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MctError::Storage(format!(
                "Failed to remove {}: {}",
                resolved.display(),
                e
            ))),
        }
    }

    fn name(&self) -> &str {
        "fs"
    }
}
