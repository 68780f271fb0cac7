//! Per-conversation mutating-tool approval gate (§4.2).
//!
//! Invariant enforced here, not just documented: at most one unresolved
//! `ApprovalRequest` exists per conversation at any time. `Store::stage_approval`
//! is the transactional boundary that makes this true even under concurrent
//! callers sharing a `SqliteStore`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::clock::{new_id, Clock};
use crate::error::{ApprovalError, StoreError};
use crate::model::{ApprovalRequest, ApprovalResolution, PreviewPayload, SafetyClass};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct ApprovalLedgerConfig {
    /// Requests older than this are lazily marked `expired` on next access.
    pub ttl: Duration,
    /// Resolving the same `(request_id, action)` twice within this window is
    /// a no-op success, not `NOT_FOUND` — tolerates caller retries.
    pub resolution_idempotency_window: Duration,
}

impl Default for ApprovalLedgerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            resolution_idempotency_window: Duration::from_secs(5),
        }
    }
}

pub struct NewApprovalRequest {
    pub conversation_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub safety_class: SafetyClass,
    pub synthetic_reason: Option<String>,
    pub preview: Option<PreviewPayload>,
}

pub struct ApprovalLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: ApprovalLedgerConfig,
}

impl ApprovalLedger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: ApprovalLedgerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Stages a new request. Fails with `AlreadyPending` if the conversation
    /// already has one unresolved — lazily expiring it first so a stale
    /// request never blocks a fresh one forever.
    pub fn stage(&self, request: NewApprovalRequest) -> Result<ApprovalRequest, ApprovalError> {
        self.expire_if_stale(&request.conversation_id)?;

        let record = ApprovalRequest {
            request_id: new_id(),
            conversation_id: request.conversation_id,
            tool_name: request.tool_name,
            arguments: request.arguments,
            safety_class: request.safety_class,
            synthetic_reason: request.synthetic_reason,
            preview: request.preview,
            created_at: self.clock.now_utc(),
            resolved_at: None,
            resolution: None,
        };

        match self.store.stage_approval(&record) {
            Ok(()) => Ok(record),
            Err(StoreError::Conflict) => Err(ApprovalError::AlreadyPending),
            Err(e) => Err(ApprovalError::Store(e)),
        }
    }

    /// Resolves the pending request for `conversation_id`. `request_id` must
    /// match the currently pending one. Resolving the same pair again inside
    /// the idempotency window returns the already-resolved record rather
    /// than erroring.
    pub fn resolve(
        &self,
        conversation_id: &str,
        request_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.expire_if_stale(conversation_id)?;

        let existing = self
            .store
            .get_approval(request_id)?
            .ok_or(ApprovalError::NotFound)?;
        if existing.conversation_id != conversation_id {
            return Err(ApprovalError::WrongRequestId);
        }

        if let Some(resolved_at) = existing.resolved_at {
            let within_window = self.clock.now_utc() - resolved_at
                <= chrono::Duration::from_std(self.config.resolution_idempotency_window)
                    .unwrap_or_default();
            if within_window && existing.resolution == Some(resolution) {
                return Ok(existing);
            }
            return Err(ApprovalError::NotFound);
        }

        let pending = self
            .store
            .get_pending_approval(conversation_id)?
            .ok_or(ApprovalError::NotFound)?;
        if pending.request_id != request_id {
            return Err(ApprovalError::WrongRequestId);
        }

        let resolved = self
            .store
            .resolve_approval(request_id, resolution, self.clock.now_utc())?
            .ok_or(ApprovalError::NotFound)?;
        Ok(resolved)
    }

    pub fn pending(&self, conversation_id: &str) -> Result<Option<ApprovalRequest>, ApprovalError> {
        self.expire_if_stale(conversation_id)?;
        Ok(self.store.get_pending_approval(conversation_id)?)
    }

    fn expire_if_stale(&self, conversation_id: &str) -> Result<(), ApprovalError> {
        let Some(pending) = self.store.get_pending_approval(conversation_id)? else {
            return Ok(());
        };
        let age = self.clock.now_utc() - pending.created_at;
        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or_default();
        if age > ttl {
            self.store
                .resolve_approval(&pending.request_id, ApprovalResolution::Expired, self.clock.now_utc())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn ledger() -> (ApprovalLedger, Arc<FakeClock>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let ledger = ApprovalLedger::new(store, clock.clone(), ApprovalLedgerConfig::default());
        (ledger, clock)
    }

    fn req(conversation_id: &str) -> NewApprovalRequest {
        NewApprovalRequest {
            conversation_id: conversation_id.to_string(),
            tool_name: "create_project".to_string(),
            arguments: serde_json::json!({"path": "projects/active/side-business"}),
            safety_class: SafetyClass::Mutating,
            synthetic_reason: Some("new_page_engine_scaffold".to_string()),
            preview: None,
        }
    }

    #[test]
    fn second_stage_without_resolution_is_already_pending() {
        let (ledger, _clock) = ledger();
        ledger.stage(req("c1")).unwrap();
        let err = ledger.stage(req("c1")).unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyPending));
    }

    #[test]
    fn resolve_clears_pending_and_is_idempotent_within_window() {
        let (ledger, clock) = ledger();
        let staged = ledger.stage(req("c1")).unwrap();
        let resolved = ledger
            .resolve("c1", &staged.request_id, ApprovalResolution::Approved)
            .unwrap();
        assert_eq!(resolved.resolution, Some(ApprovalResolution::Approved));
        assert!(ledger.pending("c1").unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let again = ledger
            .resolve("c1", &staged.request_id, ApprovalResolution::Approved)
            .unwrap();
        assert_eq!(again.request_id, resolved.request_id);
    }

    #[test]
    fn stale_pending_request_expires_and_unblocks_staging() {
        let (ledger, clock) = ledger();
        let staged = ledger.stage(req("c1")).unwrap();
        clock.advance(Duration::from_secs(31 * 60));
        let fresh = ledger.stage(req("c1")).unwrap();
        assert_ne!(fresh.request_id, staged.request_id);

        let err = ledger
            .resolve("c1", &staged.request_id, ApprovalResolution::Approved)
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound));
    }

    #[test]
    fn wrong_conversation_is_rejected() {
        let (ledger, _clock) = ledger();
        let staged = ledger.stage(req("c1")).unwrap();
        let err = ledger
            .resolve("other-conversation", &staged.request_id, ApprovalResolution::Approved)
            .unwrap_err();
        assert!(matches!(err, ApprovalError::WrongRequestId));
    }
}
