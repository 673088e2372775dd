//! Per-sender ordering and duplicate filtering for entity requests.
//!
//! The sender labels each message with a monotonic timestamp and the label of its previous
//! message to the same destination. The receiver buffers a message until its predecessor has
//! been delivered (or has fallen behind the receive horizon), then releases buffered messages
//! in label order. A message whose label is not newer than the last delivered one from the same
//! sender is a duplicate and is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::entities::RequestMessage;

/// Bookkeeping older than the reorder window is collected at most this often.
pub const MIN_INTERVAL_BETWEEN_COLLECTIONS: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSorter {
    #[serde(rename = "lastSentToInstance", default, skip_serializing_if = "BTreeMap::is_empty")]
    last_sent_to_instance: BTreeMap<String, DateTime<Utc>>,
    #[serde(rename = "receivedFromInstance", default, skip_serializing_if = "BTreeMap::is_empty")]
    received_from_instance: BTreeMap<String, ReceiveBuffer>,
    #[serde(rename = "receiveHorizon", default, skip_serializing_if = "Option::is_none")]
    receive_horizon: Option<DateTime<Utc>>,
    #[serde(rename = "sendHorizon", default, skip_serializing_if = "Option::is_none")]
    send_horizon: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ReceiveBuffer {
    #[serde(rename = "last", default, skip_serializing_if = "Option::is_none")]
    last: Option<DateTime<Utc>>,
    #[serde(rename = "executionId", default, skip_serializing_if = "Option::is_none")]
    execution_id: Option<String>,
    /// Sorted by timestamp.
    #[serde(rename = "buffered", default, skip_serializing_if = "Vec::is_empty")]
    buffered: Vec<RequestMessage>,
}

fn window(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn collection_span(reorder: chrono::Duration) -> chrono::Duration {
    reorder
        .checked_add(&window(MIN_INTERVAL_BETWEEN_COLLECTIONS))
        .unwrap_or(chrono::Duration::MAX)
}

/// `base + span < t`, with `None` standing for the beginning of time.
fn expired(base: Option<DateTime<Utc>>, span: chrono::Duration, t: DateTime<Utc>) -> bool {
    match base {
        None => true,
        Some(b) => b.checked_add_signed(span).is_some_and(|end| end < t),
    }
}

impl MessageSorter {
    /// Labels `message` for delivery to `destination`. A zero window disables labeling.
    pub fn label_outgoing_message(
        &mut self,
        message: &mut RequestMessage,
        destination: &str,
        now: DateTime<Utc>,
        reorder_window: Duration,
    ) {
        if reorder_window.is_zero() {
            return;
        }
        let reorder = window(reorder_window);
        let collect_after = collection_span(reorder);

        let mut timestamp = now;
        if expired(self.send_horizon, collect_after, timestamp) {
            self.send_horizon = Some(timestamp);
            self.last_sent_to_instance
                .retain(|_, last| !expired(Some(*last), reorder, timestamp));
        }

        if let Some(last) = self.last_sent_to_instance.get(destination) {
            message.predecessor = Some(*last);
            // labels stay strictly increasing even if the clock does not
            if timestamp <= *last {
                timestamp = *last + chrono::Duration::nanoseconds(100);
            }
        }

        message.timestamp = Some(timestamp);
        self.last_sent_to_instance.insert(destination.to_string(), timestamp);
    }

    /// Accepts one incoming message and returns the messages that may be delivered now, in order.
    pub fn receive_in_order(
        &mut self,
        message: RequestMessage,
        reorder_window: Duration,
        now: DateTime<Utc>,
    ) -> Vec<RequestMessage> {
        // client messages and forwarded lock requests do not take part in sorting
        let (Some(timestamp), Some(parent)) = (message.timestamp, message.parent_instance_id.clone()) else {
            return vec![message];
        };
        if reorder_window.is_zero() || message.position > 0 {
            return vec![message];
        }

        let reorder = window(reorder_window);
        let mut deliver = Vec::new();

        if expired(self.receive_horizon, collection_span(reorder), now) {
            self.receive_horizon = Some(now.checked_sub_signed(reorder).unwrap_or(DateTime::<Utc>::MIN_UTC));
            let horizon = self.receive_horizon;
            for buffer in self.received_from_instance.values_mut() {
                if let (Some(last), Some(h)) = (buffer.last, horizon) {
                    if last < h {
                        buffer.last = None;
                    }
                }
                while let Some(next) = Self::try_deliver_next(buffer, horizon) {
                    deliver.push(next);
                }
            }
            self.received_from_instance
                .retain(|_, b| b.last.is_some() || !b.buffered.is_empty());
        }

        if self.receive_horizon.is_some_and(|h| timestamp < h) {
            deliver.push(message);
            return deliver;
        }

        let horizon = self.receive_horizon;
        let buffer = self
            .received_from_instance
            .entry(parent)
            .or_insert_with(|| ReceiveBuffer {
                last: None,
                execution_id: message.parent_execution_id.clone(),
                buffered: Vec::new(),
            });

        if buffer.execution_id != message.parent_execution_id {
            // new sender execution: flush and start over
            deliver.append(&mut buffer.buffered);
            buffer.last = None;
            buffer.execution_id = message.parent_execution_id.clone();
        }

        if buffer.last.is_some_and(|last| timestamp <= last) {
            return deliver;
        }

        match buffer.buffered.binary_search_by(|m| m.timestamp.cmp(&Some(timestamp))) {
            Ok(pos) => buffer.buffered[pos] = message,
            Err(pos) => buffer.buffered.insert(pos, message),
        }

        while let Some(next) = Self::try_deliver_next(buffer, horizon) {
            deliver.push(next);
        }
        deliver
    }

    fn try_deliver_next(buffer: &mut ReceiveBuffer, horizon: Option<DateTime<Utc>>) -> Option<RequestMessage> {
        let first = buffer.buffered.first()?;
        let ready = match first.predecessor {
            None => true,
            Some(p) => buffer.last.is_some_and(|last| p <= last) || horizon.is_some_and(|h| p < h),
        };
        if !ready {
            return None;
        }
        let next = buffer.buffered.remove(0);
        buffer.last = next.timestamp;
        Some(next)
    }

    /// Number of messages held back waiting for a predecessor.
    pub fn buffered_count(&self) -> usize {
        self.received_from_instance.values().map(|b| b.buffered.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const WINDOW: Duration = Duration::from_secs(30);

    fn labeled(sender: &mut MessageSorter, op: &str, now: DateTime<Utc>) -> RequestMessage {
        let mut msg = RequestMessage::operation(Uuid::new_v4(), op, true, None);
        msg.parent_instance_id = Some("orch".to_string());
        msg.parent_execution_id = Some("e1".to_string());
        sender.label_outgoing_message(&mut msg, "@counter@1", now, WINDOW);
        msg
    }

    fn ops(msgs: &[RequestMessage]) -> Vec<&str> {
        msgs.iter().filter_map(|m| m.operation.as_deref()).collect()
    }

    #[test]
    fn labels_are_strictly_increasing_and_chained() {
        let mut sender = MessageSorter::default();
        let now = Utc::now();
        let a = labeled(&mut sender, "a", now);
        let b = labeled(&mut sender, "b", now);
        assert_eq!(a.predecessor, None);
        assert_eq!(b.predecessor, a.timestamp);
        assert!(b.timestamp > a.timestamp);
    }

    #[test]
    fn reorders_within_window_and_drops_duplicates() {
        let mut sender = MessageSorter::default();
        let now = Utc::now();
        let a = labeled(&mut sender, "a", now);
        let b = labeled(&mut sender, "b", now);
        let c = labeled(&mut sender, "c", now);

        let mut receiver = MessageSorter::default();
        let first = receiver.receive_in_order(c.clone(), WINDOW, now);
        assert!(first.is_empty());
        let second = receiver.receive_in_order(a.clone(), WINDOW, now);
        assert_eq!(ops(&second), vec!["a"]);
        assert_eq!(receiver.buffered_count(), 1);
        let third = receiver.receive_in_order(b, WINDOW, now);
        assert_eq!(ops(&third), vec!["b", "c"]);

        assert!(receiver.receive_in_order(a, WINDOW, now).is_empty());
        assert!(receiver.receive_in_order(c, WINDOW, now).is_empty());
    }

    #[test]
    fn unlabeled_and_forwarded_messages_pass_through() {
        let mut receiver = MessageSorter::default();
        let client = RequestMessage::operation(Uuid::new_v4(), "x", true, None);
        assert_eq!(receiver.receive_in_order(client, WINDOW, Utc::now()).len(), 1);

        let mut forwarded = RequestMessage::lock(Uuid::new_v4(), vec![]);
        forwarded.parent_instance_id = Some("orch".to_string());
        forwarded.timestamp = Some(Utc::now());
        forwarded.predecessor = Some(Utc::now());
        forwarded.position = 1;
        assert_eq!(receiver.receive_in_order(forwarded, WINDOW, Utc::now()).len(), 1);
    }

    #[test]
    fn new_sender_execution_flushes_buffer() {
        let mut sender = MessageSorter::default();
        let now = Utc::now();
        let _lost = labeled(&mut sender, "lost", now);
        let held = labeled(&mut sender, "held", now);

        let mut receiver = MessageSorter::default();
        assert!(receiver.receive_in_order(held, WINDOW, now).is_empty());

        let mut fresh = RequestMessage::operation(Uuid::new_v4(), "fresh", true, None);
        fresh.parent_instance_id = Some("orch".to_string());
        fresh.parent_execution_id = Some("e2".to_string());
        MessageSorter::default().label_outgoing_message(&mut fresh, "@counter@1", now, WINDOW);

        let out = receiver.receive_in_order(fresh, WINDOW, now);
        assert_eq!(ops(&out), vec!["held", "fresh"]);
    }

    #[test]
    fn buffered_messages_are_released_once_predecessor_is_past_horizon() {
        let mut sender = MessageSorter::default();
        let sent_at = Utc::now();
        let _lost = labeled(&mut sender, "lost", sent_at);
        let held = labeled(&mut sender, "held", sent_at);

        let mut receiver = MessageSorter::default();
        assert!(receiver.receive_in_order(held, WINDOW, sent_at).is_empty());

        let later = sent_at + chrono::Duration::minutes(5);
        let mut other = RequestMessage::operation(Uuid::new_v4(), "other", true, None);
        other.parent_instance_id = Some("someone-else".to_string());
        other.timestamp = Some(later);
        let out = receiver.receive_in_order(other, WINDOW, later);
        assert_eq!(ops(&out), vec!["held", "other"]);
    }

    #[test]
    fn zero_window_disables_sorting() {
        let mut sender = MessageSorter::default();
        let mut msg = RequestMessage::operation(Uuid::new_v4(), "a", true, None);
        sender.label_outgoing_message(&mut msg, "@x@y", Utc::now(), Duration::ZERO);
        assert!(msg.timestamp.is_none());
    }
}
