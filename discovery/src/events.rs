//! Bounded buffers between node discovery and slow consumers.
//!
//! Each consumer gets its own buffer. When a consumer falls behind, new
//! nodes for it are dropped and its buffer counts as saturated; lookups stop
//! starting new rounds while any buffer is saturated.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use super::node::Node;

/// Shared "a consumer is behind" signal: the number of saturated buffers.
#[derive(Debug, Clone, Default)]
pub struct ThrottleFlag(Arc<AtomicUsize>);

impl ThrottleFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn lower(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            });
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

// State shared by both halves of one buffer
#[derive(Debug)]
struct BufferState {
    occupancy: AtomicUsize,
    saturated: AtomicBool,
    throttle: ThrottleFlag,
}

impl BufferState {
    fn saturate(&self) {
        if !self.saturated.swap(true, Ordering::SeqCst) {
            self.throttle.raise();
        }
    }

    fn release(&self) {
        if self.saturated.swap(false, Ordering::SeqCst) {
            self.throttle.lower();
        }
    }
}

/// Producing half.
#[derive(Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Node>,
    state: Arc<BufferState>,
}

/// Consuming half. Dropping it releases its share of the throttle.
pub struct EventReceiver {
    receiver: mpsc::Receiver<Node>,
    state: Arc<BufferState>,
    capacity: usize,
}

pub fn event_buffer(capacity: usize, throttle: ThrottleFlag) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    let (sender, receiver) = mpsc::channel(capacity);
    let state = Arc::new(BufferState {
        occupancy: AtomicUsize::new(0),
        saturated: AtomicBool::new(false),
        throttle,
    });
    (
        EventSender {
            sender,
            state: Arc::clone(&state),
        },
        EventReceiver {
            receiver,
            state,
            capacity,
        },
    )
}

impl EventSender {
    /// Queue a node without waiting. On a full buffer the node is dropped
    /// and the buffer marked saturated.
    pub fn try_push(&self, node: Node) -> bool {
        // Counted before sending so a concurrent pop never sees it missing
        self.state.occupancy.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(node) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(node)) => {
                self.state.occupancy.fetch_sub(1, Ordering::SeqCst);
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Discovery buffer full, dropping {}", node);
                }
                self.state.saturate();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.state.occupancy.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }
}

impl EventReceiver {
    /// Next buffered node, `None` once every sender is gone.
    pub async fn pop(&mut self) -> Option<Node> {
        let node = self.receiver.recv().await?;
        let previous = self.state.occupancy.fetch_sub(1, Ordering::SeqCst);
        if previous.saturating_sub(1) < self.capacity {
            self.state.release();
        }
        Some(node)
    }

    /// Nodes queued and not popped yet.
    pub fn len(&self) -> usize {
        self.state.occupancy.load(Ordering::SeqCst)
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.state.release();
    }
}
