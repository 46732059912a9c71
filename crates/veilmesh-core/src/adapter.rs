//! Virtual network adapter seam.
//!
//! The node never touches tun/tap devices directly; it consumes this
//! trait. Production embedders wrap their platform driver, tests use
//! [`ChannelAdapter`], which shuttles frames over in-memory channels.

use crate::error::{CoreError, CoreResult};
use crate::identity::MacAddr;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use tokio::sync::{Mutex, mpsc};

/// A virtual L2/L3 network interface.
#[async_trait]
pub trait VirtualAdapter: Send + Sync {
    /// Start the adapter device.
    async fn start(&self) -> CoreResult<()>;

    /// Stop the adapter device.
    async fn stop(&self) -> CoreResult<()>;

    /// Bring the interface up.
    async fn up(&self) -> CoreResult<()>;

    /// Take the interface down.
    async fn down(&self) -> CoreResult<()>;

    /// Assign the overlay address.
    async fn configure(&self, ip: Ipv4Addr, netmask: Ipv4Addr) -> CoreResult<()>;

    /// Link-layer address of the interface.
    fn mac(&self) -> MacAddr;

    /// Currently assigned IPv4 addresses.
    fn ip_addresses(&self) -> Vec<Ipv4Addr>;

    /// Read one outbound frame from the OS side.
    async fn read_frame(&self) -> CoreResult<Vec<u8>>;

    /// Write one inbound frame to the OS side.
    async fn write_frame(&self, frame: &[u8]) -> CoreResult<()>;
}

/// In-memory adapter backed by mpsc channels.
///
/// Frames pushed with [`ChannelAdapter::inject`] appear on
/// [`VirtualAdapter::read_frame`]; frames the node writes surface on the
/// receiver returned by [`ChannelAdapter::new`].
pub struct ChannelAdapter {
    mac: MacAddr,
    ip: Option<Ipv4Addr>,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    written_tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelAdapter {
    /// Create an adapter; the returned receiver yields frames written by
    /// the node.
    #[must_use]
    pub fn new(mac: MacAddr, ip: Option<Ipv4Addr>) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (written_tx, written_rx) = mpsc::channel(64);
        let adapter = Self {
            mac,
            ip,
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
            written_tx,
        };
        (adapter, written_rx)
    }

    /// Feed a frame into the adapter, as if the OS emitted it.
    ///
    /// # Errors
    ///
    /// `CoreError::Adapter` when the adapter queue is closed.
    pub async fn inject(&self, frame: Vec<u8>) -> CoreResult<()> {
        self.inbound_tx
            .send(frame)
            .await
            .map_err(|_| CoreError::Adapter("adapter queue closed".into()))
    }

    /// Sender half for injecting frames from another task.
    #[must_use]
    pub fn injector(&self) -> mpsc::Sender<Vec<u8>> {
        self.inbound_tx.clone()
    }
}

#[async_trait]
impl VirtualAdapter for ChannelAdapter {
    async fn start(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn stop(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn up(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn down(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn configure(&self, _ip: Ipv4Addr, _netmask: Ipv4Addr) -> CoreResult<()> {
        Ok(())
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn ip_addresses(&self) -> Vec<Ipv4Addr> {
        self.ip.into_iter().collect()
    }

    async fn read_frame(&self) -> CoreResult<Vec<u8>> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| CoreError::Adapter("adapter queue closed".into()))
    }

    async fn write_frame(&self, frame: &[u8]) -> CoreResult<()> {
        self.written_tx
            .send(frame.to_vec())
            .await
            .map_err(|_| CoreError::Adapter("adapter queue closed".into()))
    }
}
