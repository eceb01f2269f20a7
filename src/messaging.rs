//! Change notifications from the rule controller to the synchronizer
//!
//! Delivery is fire-and-forget and at most once. A notification carries the
//! full group list; the receiver treats that payload as authoritative and
//! never goes back to the store for it.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::model::Group;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    UpdateGroups { groups: Vec<Group> },
}

/// Reply to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

/// Service lifecycle triggers; both (re)load persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Installed,
    Startup,
}

#[derive(Debug)]
pub enum Envelope {
    Notify {
        message: Message,
        reply: Option<oneshot::Sender<Ack>>,
    },
    Lifecycle(LifecycleEvent),
}

pub trait Notifier: Send + Sync {
    /// Hand the full group list to the synchronizer. `false` means the
    /// message was dropped; it is never retried.
    fn notify_groups(&self, groups: &[Group]) -> bool;
}

/// Notifier backed by the synchronizer's mpsc inbox
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Envelope>,
    acks: Option<mpsc::UnboundedSender<oneshot::Receiver<Ack>>>,
}

impl ChannelNotifier {
    #[cfg(test)]
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx, acks: None }
    }

    /// Also forward each reply handle so the caller can wait for the
    /// synchronizer to finish with a change.
    pub fn with_acks(
        tx: mpsc::UnboundedSender<Envelope>,
    ) -> (Self, mpsc::UnboundedReceiver<oneshot::Receiver<Ack>>) {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                acks: Some(ack_tx),
            },
            ack_rx,
        )
    }
}

impl Notifier for ChannelNotifier {
    fn notify_groups(&self, groups: &[Group]) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope::Notify {
            message: Message::UpdateGroups {
                groups: groups.to_vec(),
            },
            reply: Some(reply_tx),
        };
        match self.tx.send(envelope) {
            Ok(()) => {
                debug!("📨 Sent updateGroups with {} groups", groups.len());
                if let Some(acks) = &self.acks {
                    let _ = acks.send(reply_rx);
                }
                true
            }
            Err(_) => {
                warn!("⚠️  Synchronizer is not listening, change notification dropped");
                false
            }
        }
    }
}

/// Notifier for when no synchronizer runs in this process
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify_groups(&self, _groups: &[Group]) -> bool {
        false
    }
}
