use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

/// Type of lifecycle event being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditEventType {
    WalletCreated,
    WalletDeactivated,
    KeyCreated,
    KeyDeactivated,
    Proposal,
    Signature,
    Execution,
    Rejection,
    Expiry,
    Attestation,
    Submission,
    Error,
}

/// Record of a quorum-related event
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    /// Wallet, transaction or key the event is about.
    pub subject: String,
    pub actor: Option<String>,
    pub message: String,
    pub timestamp: String,
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type,
            subject: subject.into(),
            actor: None,
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn event_type_label(&self) -> &'static str {
        match self.event_type {
            AuditEventType::WalletCreated => "WALLET_CREATED",
            AuditEventType::WalletDeactivated => "WALLET_DEACTIVATED",
            AuditEventType::KeyCreated => "KEY_CREATED",
            AuditEventType::KeyDeactivated => "KEY_DEACTIVATED",
            AuditEventType::Proposal => "PROPOSE",
            AuditEventType::Signature => "SIGN",
            AuditEventType::Execution => "EXECUTE",
            AuditEventType::Rejection => "REJECT",
            AuditEventType::Expiry => "EXPIRE",
            AuditEventType::Attestation => "ATTEST",
            AuditEventType::Submission => "SUBMIT",
            AuditEventType::Error => "ERROR",
        }
    }
}

/// Bounded in-memory audit trail; oldest entries are evicted first.
pub struct AuditTrail {
    records: Mutex<VecDeque<AuditRecord>>,
    max_entries: usize,
}

impl AuditTrail {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new event in the audit log
    pub fn log(&self, record: AuditRecord) {
        info!(
            target: "audit",
            event = record.event_type_label(),
            subject = %record.subject,
            actor = record.actor.as_deref().unwrap_or("-"),
            "{}",
            record.message
        );
        let mut records = self.lock_records();
        if records.len() == self.max_entries {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent entries, newest first
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let records = self.lock_records();
        records.iter().rev().take(count).cloned().collect()
    }

    /// All retained entries about one subject, oldest first
    pub fn for_subject(&self, subject: &str) -> Vec<AuditRecord> {
        let records = self.lock_records();
        records.iter().filter(|r| r.subject == subject).cloned().collect()
    }
}

/// Helper to get current timestamp as RFC3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
