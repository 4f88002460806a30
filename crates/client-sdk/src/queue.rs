//! Outbound messages while the gateway is unreachable.
//!
//! The queue and the live link share one lock, so a message submitted while
//! a reconnect is flushing can never overtake the messages queued before it.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use mc_protocol::WsMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::types::ClientError;

pub type LiveLink = mpsc::UnboundedSender<WsMessage>;

/// Where a submitted message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Sent,
    Queued,
}

struct Queued {
    call_id: String,
    message: WsMessage,
    expects_reply: bool,
    expires_at: Instant,
}

pub struct OutboundQueue {
    entries: VecDeque<Queued>,
    capacity: usize,
    message_timeout: Duration,
    live: Option<LiveLink>,
    /// Calls written to the current connection and not yet answered.
    in_flight: HashSet<String>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, message_timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            message_timeout,
            live: None,
            in_flight: HashSet::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Send now if connected, otherwise queue.
    pub fn submit(&mut self, call_id: &str, mut message: WsMessage, expects_reply: bool) -> Result<Submitted, ClientError> {
        if let Some(link) = &self.live {
            match link.send(message) {
                Ok(()) => {
                    if expects_reply {
                        self.in_flight.insert(call_id.to_owned());
                    }
                    return Ok(Submitted::Sent);
                }
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
            self.live = None;
        }

        if self.entries.len() >= self.capacity {
            return Err(ClientError::QueueFull(self.capacity));
        }
        self.entries.push_back(Queued {
            call_id: call_id.to_owned(),
            message,
            expects_reply,
            expires_at: Instant::now() + self.message_timeout,
        });
        Ok(Submitted::Queued)
    }

    /// Attach a fresh connection and flush the queue onto it in order.
    /// Returns the ids of queued messages that expired before they could be
    /// sent.
    pub fn go_live(&mut self, link: LiveLink) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.pop_front() {
            if entry.expires_at <= now {
                expired.push(entry.call_id);
                continue;
            }
            if link.send(entry.message).is_err() {
                // The connection died mid-flush; keep nothing half-sent.
                expired.push(entry.call_id);
                continue;
            }
            if entry.expects_reply {
                self.in_flight.insert(entry.call_id);
            }
        }
        self.live = Some(link);
        expired
    }

    /// Detach the connection.  Returns the calls that were written to it
    /// and will now never be answered.
    pub fn go_offline(&mut self) -> Vec<String> {
        self.live = None;
        self.in_flight.drain().collect()
    }

    /// A response for `call_id` arrived.
    pub fn acknowledge(&mut self, call_id: &str) {
        self.in_flight.remove(call_id);
    }

    /// Remove a still-queued message.  `false` if it was already sent.
    pub fn withdraw(&mut self, call_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.call_id != call_id);
        before != self.entries.len()
    }

    /// Empty everything (shutdown).  Returns every id still owed an answer.
    pub fn drain(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.drain(..).map(|e| e.call_id).collect();
        ids.extend(self.go_offline());
        ids
    }
}
