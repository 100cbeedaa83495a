//! Append-only log of version transitions per instance.
//!
//! Entries start `pending` and move once to a terminal status. After that
//! they are never rewritten. Rollback resolution reads only this log.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use corehost_core::{
    HistoryEntryId, InstanceId, StorageBackend, VersionId, WritePrecondition, WriteResult,
};

use crate::error::{ReleaseError, Result};
use crate::paths;

/// Status of one version transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// Recorded, instance not yet switched.
    Pending,
    /// Forward update finished.
    Completed,
    /// Rollback finished.
    RolledBack,
    /// The transition did not take effect.
    Failed,
}

impl HistoryStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(self, Self::Pending) && target.is_terminal()
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One version transition of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Entry identifier.
    pub id: HistoryEntryId,
    /// The instance that changed version.
    pub instance_id: InstanceId,
    /// Version before the transition.
    pub from_version: VersionId,
    /// Version after the transition.
    pub to_version: VersionId,
    /// Transition status.
    pub status: HistoryStatus,
    /// Free-form note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When the entry was appended.
    pub created_at: DateTime<Utc>,
    /// When the entry reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    /// Creates a pending entry.
    #[must_use]
    pub fn pending(instance_id: InstanceId, from: VersionId, to: VersionId) -> Self {
        Self {
            id: HistoryEntryId::generate(),
            instance_id,
            from_version: from,
            to_version: to,
            status: HistoryStatus::Pending,
            notes: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Attaches a note.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Newest first: creation time, then ID for entries created in the same instant.
fn newest_first(a: &HistoryEntry, b: &HistoryEntry) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
}

/// Storage-backed history ledger.
#[derive(Clone)]
pub struct VersionHistoryLedger {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for VersionHistoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionHistoryLedger").finish_non_exhaustive()
    }
}

impl VersionHistoryLedger {
    /// Creates a ledger over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Appends a new entry.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Conflict`] if an entry with the same ID exists.
    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let key = paths::history_entry(entry.instance_id, &entry.id);
        let bytes = Bytes::from(serde_json::to_vec(entry)?);
        match self
            .storage
            .put(&key, bytes, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(ReleaseError::conflict(format!(
                "history entry {} already exists",
                entry.id
            ))),
        }
    }

    /// Moves a pending entry to a terminal status and stamps `completedAt`.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if the entry does not exist and
    /// [`ReleaseError::InvalidOperation`] if it is already terminal.
    pub async fn finish(
        &self,
        instance_id: InstanceId,
        id: &HistoryEntryId,
        status: HistoryStatus,
        notes: Option<String>,
    ) -> Result<HistoryEntry> {
        let key = paths::history_entry(instance_id, id);
        let Some(meta) = self.storage.head(&key).await? else {
            return Err(ReleaseError::not_found("history entry", id));
        };
        let mut entry: HistoryEntry = serde_json::from_slice(&self.storage.get(&key).await?)?;
        if !entry.status.can_transition_to(status) {
            return Err(ReleaseError::invalid_operation(format!(
                "history entry {id} is {} and cannot become {status}",
                entry.status
            )));
        }
        entry.status = status;
        entry.completed_at = Some(Utc::now());
        if notes.is_some() {
            entry.notes = notes;
        }

        let bytes = Bytes::from(serde_json::to_vec(&entry)?);
        match self
            .storage
            .put(&key, bytes, WritePrecondition::MatchesVersion(meta.version))
            .await?
        {
            WriteResult::Success { .. } => Ok(entry),
            WriteResult::PreconditionFailed { .. } => Err(ReleaseError::conflict(format!(
                "history entry {id} was modified concurrently"
            ))),
        }
    }

    /// Lists an instance's entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage or decode error.
    pub async fn list_by_instance(&self, instance_id: InstanceId) -> Result<Vec<HistoryEntry>> {
        let metas = self
            .storage
            .list(&paths::history_prefix(instance_id))
            .await?;
        let mut entries = Vec::with_capacity(metas.len());
        for meta in metas {
            match self.storage.get(&meta.path).await {
                Ok(bytes) => entries.push(serde_json::from_slice::<HistoryEntry>(&bytes)?),
                // Listed then removed; nothing to report.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        entries.sort_by(newest_first);
        Ok(entries)
    }

    /// Returns the completed entry that has `skip` newer completed entries
    /// before it.
    ///
    /// `skip == 0` is the most recent completed entry. Entries in any other
    /// status are ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage or decode error.
    pub async fn find_completed_before(
        &self,
        instance_id: InstanceId,
        skip: usize,
    ) -> Result<Option<HistoryEntry>> {
        Ok(self
            .list_by_instance(instance_id)
            .await?
            .into_iter()
            .filter(|e| e.status == HistoryStatus::Completed)
            .nth(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corehost_core::MemoryBackend;

    fn v(s: &str) -> VersionId {
        s.parse().unwrap()
    }

    fn ledger() -> VersionHistoryLedger {
        VersionHistoryLedger::new(Arc::new(MemoryBackend::new()))
    }

    async fn completed(ledger: &VersionHistoryLedger, instance: InstanceId, from: &str, to: &str) {
        let entry = HistoryEntry::pending(instance, v(from), v(to));
        ledger.append(&entry).await.unwrap();
        ledger
            .finish(instance, &entry.id, HistoryStatus::Completed, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lists_newest_first_per_instance() {
        let ledger = ledger();
        let a = InstanceId::new(1);
        completed(&ledger, a, "v1.0.0", "v1.1.0").await;
        completed(&ledger, a, "v1.1.0", "v1.2.0").await;
        completed(&ledger, InstanceId::new(2), "v1.0.0", "v2.0.0").await;

        let entries = ledger.list_by_instance(a).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].to_version, v("v1.2.0"));
        assert_eq!(entries[1].to_version, v("v1.1.0"));
        assert!(entries.iter().all(|e| e.completed_at.is_some()));
    }

    #[tokio::test]
    async fn terminal_entries_are_not_rewritten() {
        let ledger = ledger();
        let instance = InstanceId::new(3);
        let entry = HistoryEntry::pending(instance, v("v1.0.0"), v("v1.1.0"));
        ledger.append(&entry).await.unwrap();
        ledger
            .finish(instance, &entry.id, HistoryStatus::Completed, None)
            .await
            .unwrap();

        let err = ledger
            .finish(instance, &entry.id, HistoryStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidOperation { .. }));
    }

    #[tokio::test]
    async fn find_completed_before_ignores_other_statuses() {
        let ledger = ledger();
        let instance = InstanceId::new(4);
        completed(&ledger, instance, "v1.0.0", "v1.1.0").await;

        let rollback = HistoryEntry::pending(instance, v("v1.1.0"), v("v1.0.0"));
        ledger.append(&rollback).await.unwrap();
        ledger
            .finish(instance, &rollback.id, HistoryStatus::RolledBack, None)
            .await
            .unwrap();
        let pending = HistoryEntry::pending(instance, v("v1.0.0"), v("v1.2.0"));
        ledger.append(&pending).await.unwrap();

        let newest = ledger.find_completed_before(instance, 0).await.unwrap().unwrap();
        assert_eq!(newest.to_version, v("v1.1.0"));
        assert!(ledger.find_completed_before(instance, 1).await.unwrap().is_none());
    }

    #[test]
    fn status_transitions() {
        assert!(HistoryStatus::Pending.can_transition_to(HistoryStatus::RolledBack));
        assert!(!HistoryStatus::Pending.can_transition_to(HistoryStatus::Pending));
        assert!(!HistoryStatus::Completed.can_transition_to(HistoryStatus::Failed));
        assert_eq!(
            serde_json::to_string(&HistoryStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
    }
}
