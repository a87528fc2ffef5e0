use chrono::{DateTime, Utc};
use log::warn;
use std::collections::VecDeque;
use std::fmt;

use crate::api::models::{DeliveryStatus, MessageId, ServerId, TempId};

/// Conditions that are ignored functionally but kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    OrphanAck { temp_id: TempId, server_id: ServerId },
    DuplicateAck { temp_id: TempId, server_id: ServerId },
    OrphanFailure { temp_id: TempId },
    ExpiredEvent { kind: &'static str, message_id: ServerId },
    EvictedEvent { kind: &'static str, message_id: ServerId },
    MalformedFrame { reason: String },
    RejectedTransition {
        message_id: MessageId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    ServerMessageWithoutId,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::OrphanAck { temp_id, server_id } => {
                write!(f, "ack {server_id} for unknown send {temp_id}")
            }
            Anomaly::DuplicateAck { temp_id, server_id } => {
                write!(f, "duplicate ack {server_id} for {temp_id}")
            }
            Anomaly::OrphanFailure { temp_id } => write!(f, "failure for unknown send {temp_id}"),
            Anomaly::ExpiredEvent { kind, message_id } => {
                write!(f, "{kind} for missing message {message_id} expired")
            }
            Anomaly::EvictedEvent { kind, message_id } => {
                write!(f, "{kind} for missing message {message_id} evicted, buffer full")
            }
            Anomaly::MalformedFrame { reason } => write!(f, "dropped malformed frame: {reason}"),
            Anomaly::RejectedTransition { message_id, from, to } => {
                write!(f, "rejected status {from} -> {to} on {message_id}")
            }
            Anomaly::ServerMessageWithoutId => f.write_str("server message without permanent id"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyRecord {
    pub at: DateTime<Utc>,
    pub anomaly: Anomaly,
}

/// Bounded ring of the most recent anomalies.
#[derive(Debug)]
pub struct AnomalyLog {
    capacity: usize,
    entries: VecDeque<AnomalyRecord>,
    total: u64,
}

impl AnomalyLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            total: 0,
        }
    }

    pub fn record(&mut self, anomaly: Anomaly) {
        warn!("sync anomaly: {anomaly}");
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(AnomalyRecord {
            at: Utc::now(),
            anomaly,
        });
        self.total += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnomalyRecord> {
        self.entries.iter()
    }

    /// Count of every anomaly ever recorded, including ones rotated out.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest() {
        let mut log = AnomalyLog::new(2);
        for n in 0..3 {
            log.record(Anomaly::MalformedFrame {
                reason: n.to_string(),
            });
        }
        let reasons: Vec<_> = log
            .iter()
            .map(|r| match &r.anomaly {
                Anomaly::MalformedFrame { reason } => reason.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(reasons, vec!["1", "2"]);
        assert_eq!(log.total(), 3);
    }
}
