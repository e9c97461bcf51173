//! Per-transfer bookkeeping

use crate::types::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Transfer lifecycle.
///
/// Receive: `Initializing -> Receiving -> Processing -> Completed`.
/// Send: `Sending -> Completed`. Any state may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Initializing,
    Receiving,
    Processing,
    Sending,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Initializing => "initializing",
            TransferStatus::Receiving => "receiving",
            TransferStatus::Processing => "processing",
            TransferStatus::Sending => "sending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct TransferState {
    pub transfer_id: String,
    pub dataset_id: String,
    pub total_chunks: usize,
    pub status: TransferStatus,
    received_volume: HashSet<usize>,
    received_labels: HashSet<usize>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransferState {
    pub fn new(transfer_id: String, dataset_id: String, total_chunks: usize, status: TransferStatus) -> Self {
        Self {
            transfer_id,
            dataset_id,
            total_chunks,
            status,
            received_volume: HashSet::new(),
            received_labels: HashSet::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Record a successful chunk write; resends count once
    pub fn mark_received(&mut self, channel: Channel, index: usize) {
        match channel {
            Channel::Volume => self.received_volume.insert(index),
            Channel::Labels => self.received_labels.insert(index),
        };
    }

    pub fn received(&self, channel: Channel) -> usize {
        match channel {
            Channel::Volume => self.received_volume.len(),
            Channel::Labels => self.received_labels.len(),
        }
    }

    /// Indices in `0..total_chunks` not yet received, ascending
    pub fn missing(&self, channel: Channel) -> Vec<usize> {
        let received = match channel {
            Channel::Volume => &self.received_volume,
            Channel::Labels => &self.received_labels,
        };
        (0..self.total_chunks)
            .filter(|index| !received.contains(index))
            .collect()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        let volume_chunks = self.received(Channel::Volume);
        let label_chunks = self.received(Channel::Labels);
        // The grayscale channel drives progress; label-only transfers fall back to labels.
        let driving = volume_chunks.max(label_chunks);
        let percent = if self.total_chunks == 0 {
            100.0
        } else {
            driving as f64 * 100.0 / self.total_chunks as f64
        };
        TransferSnapshot {
            transfer_id: self.transfer_id.clone(),
            dataset_id: self.dataset_id.clone(),
            status: self.status,
            total_chunks: self.total_chunks,
            volume_chunks,
            label_chunks,
            percent,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a transfer for operational listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub transfer_id: String,
    pub dataset_id: String,
    pub status: TransferStatus,
    pub total_chunks: usize,
    pub volume_chunks: usize,
    pub label_chunks: usize,
    pub percent: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
