//! Batch outcomes reported back to the queue transport.
//!
//! A consumer's unit boundary is the queue batch. Failures travel as a list
//! of item identifiers so the transport redelivers only the failed subset;
//! a thrown top-level error would punish already-processed messages.

use uuid::Uuid;

use super::queue::{ReceiptHandle, ReceivedMessage};

/// Whether a failure is worth redelivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient: outage, timeout, throttling. Redelivery may succeed.
    Retryable,
    /// Input error: malformed body, rejected path. Redelivery cannot help;
    /// the receive budget moves these aside into the dead-letter store.
    Permanent,
}

#[derive(Debug, Clone)]
pub struct FailedItem {
    pub id: Uuid,
    pub disposition: Disposition,
}

/// Per-batch result: which item identifiers failed, and how.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub failed: Vec<FailedItem>,
}

impl BatchOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    /// Fail every message in the batch, the conservative whole-batch policy.
    pub fn fail_all(messages: &[ReceivedMessage], disposition: Disposition) -> Self {
        Self {
            failed: messages
                .iter()
                .map(|message| FailedItem {
                    id: message.id,
                    disposition,
                })
                .collect(),
        }
    }

    pub fn record_failure(&mut self, id: Uuid, disposition: Disposition) {
        if !self.is_failed(id) {
            self.failed.push(FailedItem { id, disposition });
        }
    }

    pub fn is_failed(&self, id: Uuid) -> bool {
        self.failed.iter().any(|item| item.id == id)
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Receipt handles safe to acknowledge: every message not reported failed.
    pub fn acknowledgable<'a>(&self, messages: &'a [ReceivedMessage]) -> Vec<ReceiptHandle> {
        messages
            .iter()
            .filter(|message| !self.is_failed(message.id))
            .map(|message| message.receipt)
            .collect()
    }
}
