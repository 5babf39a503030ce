//! Outbound message seam and the UDP channel implementing it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, trace};
use metrics::counter;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::config::DiscoveryConfig;
use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeIdentity;
use super::manager::DiscoveryManager;
use super::messages::{open, seal, Message, MAX_PACKET_SIZE};
use super::node::Node;
use super::time::get_current_time_in_seconds;

/// Maximum number of packets handled concurrently.
/// Packets arriving beyond this are dropped.
pub const MAX_CONCURRENT_HANDLERS: usize = 64;

/// Sends protocol messages to peers.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, to: &Node, message: Message) -> DiscoveryResult<()>;
}

/// Signed datagrams over a UDP socket.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    identity: Arc<NodeIdentity>,
    handler_semaphore: Arc<Semaphore>,
}

impl UdpChannel {
    pub async fn bind(config: &DiscoveryConfig, identity: Arc<NodeIdentity>) -> DiscoveryResult<Arc<Self>> {
        let bind_address = config.get_bind_address();
        let socket = UdpSocket::bind(&bind_address)
            .await
            .map_err(|e| DiscoveryError::BindFailed(bind_address.clone(), e))?;

        if log::log_enabled!(log::Level::Info) {
            info!(
                "Discovery listening on {} (node_id: {})",
                socket.local_addr()?,
                identity.node_id()
            );
        }

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            identity,
            handler_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS)),
        }))
    }

    pub fn local_addr(&self) -> DiscoveryResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Receive loop. Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, manager: Arc<DiscoveryManager>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(e) => {
                        if log::log_enabled!(log::Level::Error) {
                            error!("Error receiving packet: {}", e);
                        }
                        continue;
                    }
                }
            };

            counter!("discovery_packets_received").increment(1);
            if log::log_enabled!(log::Level::Trace) {
                trace!("Received {} bytes from {}", len, from);
            }

            let permit = match self.handler_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!(
                            "Dropping packet from {} (at handler capacity {})",
                            from, MAX_CONCURRENT_HANDLERS
                        );
                    }
                    counter!("discovery_packets_rejected").increment(1);
                    continue;
                }
            };

            let data = buf[..len].to_vec();
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_packet(&manager, &data, from).await {
                    counter!("discovery_packets_rejected").increment(1);
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Error handling packet from {}: {}", from, e);
                    }
                }
            });
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Discovery receive loop stopped");
        }
    }
}

/// Authenticate a datagram and hand it to the manager of its sender.
async fn handle_packet(
    manager: &DiscoveryManager,
    data: &[u8],
    from: SocketAddr,
) -> DiscoveryResult<()> {
    let (sender_id, message) = open(data, get_current_time_in_seconds())?;
    if log::log_enabled!(log::Level::Debug) {
        debug!("{} from {} ({})", message.kind(), sender_id, from);
    }
    manager
        .on_incoming_message(&Node::from_address(sender_id, from), message)
        .await
}

#[async_trait]
impl MessageSender for UdpChannel {
    async fn send(&self, to: &Node, message: Message) -> DiscoveryResult<()> {
        let data = seal(&self.identity, &message)?;
        self.socket.send_to(&data, to.address()).await?;

        counter!("discovery_packets_sent").increment(1);
        if log::log_enabled!(log::Level::Trace) {
            trace!("Sent {} ({} bytes) to {}", message.kind(), data.len(), to);
        }
        Ok(())
    }
}
