use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    CompletionRecord, Fund, JobError, JobRecord, JobStatusUpdate, LedgerTransaction,
    LoadedTransaction, NewJob, NewOutboxMessage, OutboxMessage, OutboxStatus, OutboxStatusCounts,
    Security, StatusDescriptor, TransactionDraft, TransactionStatus, TransactionSubType,
    TransactionType,
};
use crate::infrastructure::idempotency::{IdempotencyGuardTrait, IdempotencyKey};
use crate::infrastructure::instrument_catalog::{InstrumentCatalogTrait, StagedInstrument, UpsertCounts};
use crate::infrastructure::job_store::{JobOutboxBuilder, JobStoreTrait};
use crate::infrastructure::ledger_store::{
    CompletionStoreTrait, LedgerStoreTrait, RecordedTransaction, TransactionOutboxBuilder,
};
use crate::infrastructure::outbox::OutboxRepositoryTrait;

#[derive(Default)]
struct StoreState {
    funds: HashMap<i32, Fund>,
    securities: BTreeMap<String, Security>,
    types: HashMap<i32, TransactionType>,
    sub_types: HashMap<i32, TransactionSubType>,
    statuses: HashMap<i32, StatusDescriptor>,
    transactions: BTreeMap<i64, LedgerTransaction>,
    transaction_keys: HashMap<Uuid, i64>,
    outbox: BTreeMap<i64, OutboxMessage>,
    claims: HashMap<i64, DateTime<Utc>>,
    processed: HashSet<String>,
    jobs: BTreeMap<i64, JobRecord>,
    staged: Vec<StagedInstrument>,
    completions: HashMap<String, CompletionRecord>,
    next_transaction_id: i64,
    next_outbox_id: i64,
    next_job_id: i64,
    next_security_id: i32,
}

/// Every store trait over one mutex-guarded state, for tests. The worker
/// binary only uses the Postgres stores. Each trait call is a single
/// critical section, which is what makes the multi-row writes atomic.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    claim_lease: Duration,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                next_transaction_id: 1,
                next_outbox_id: 1,
                next_job_id: 1,
                next_security_id: 1,
                ..Default::default()
            })),
            claim_lease: Duration::from_secs(30),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fund 1, sub-type 1 of type 1, the three transaction statuses and
    /// security 1 (PETR4).
    pub fn with_reference_data() -> Self {
        let store = Self::new();
        store.add_fund(Fund {
            id: 1,
            code: "FND001".to_string(),
            name: "Core Equity Fund".to_string(),
        });
        store.add_sub_type(
            TransactionType {
                id: 1,
                description: "Trade".to_string(),
            },
            TransactionSubType {
                id: 1,
                description: "Buy".to_string(),
                type_id: 1,
                transaction_type: None,
            },
        );
        store.add_security("PETR4", "Petrobras PN");
        for (id, description) in [(1, "Pending"), (2, "Executed"), (8, "Failed")] {
            store.add_status(StatusDescriptor {
                id,
                description: description.to_string(),
            });
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("database connection refused"));
        }
        Ok(())
    }

    /// Makes every store call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn add_fund(&self, fund: Fund) {
        self.lock().funds.insert(fund.id, fund);
    }

    pub fn add_sub_type(&self, transaction_type: TransactionType, sub_type: TransactionSubType) {
        let mut state = self.lock();
        state.types.insert(transaction_type.id, transaction_type);
        state.sub_types.insert(sub_type.id, sub_type);
    }

    pub fn add_status(&self, status: StatusDescriptor) {
        self.lock().statuses.insert(status.id, status);
    }

    pub fn add_security(&self, ticker: &str, name: &str) -> i32 {
        let mut state = self.lock();
        let id = state.next_security_id;
        state.next_security_id += 1;
        state.securities.insert(
            ticker.to_uppercase(),
            Security {
                id,
                ticker: ticker.to_uppercase(),
                name: name.to_string(),
            },
        );
        id
    }

    pub fn stage_instruments(&self, instruments: Vec<StagedInstrument>) {
        self.lock().staged.extend(instruments);
    }

    pub fn securities(&self) -> Vec<Security> {
        self.lock().securities.values().cloned().collect()
    }

    pub fn transaction(&self, id: i64) -> Option<LedgerTransaction> {
        self.lock().transactions.get(&id).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    /// Mutates a stored transaction in place, bypassing the domain rules.
    pub fn tamper_transaction(&self, id: i64, change: impl FnOnce(&mut LedgerTransaction)) {
        if let Some(transaction) = self.lock().transactions.get_mut(&id) {
            change(transaction);
        }
    }

    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.lock().outbox.values().cloned().collect()
    }

    pub fn outbox_message(&self, id: i64) -> Option<OutboxMessage> {
        self.lock().outbox.get(&id).cloned()
    }

    /// Stages an outbox row directly, outside any business write.
    pub fn insert_outbox(&self, message: NewOutboxMessage) -> i64 {
        let mut state = self.lock();
        Self::stage_outbox(&mut state, message)
    }

    pub fn job(&self, id: i64) -> Option<JobRecord> {
        self.lock().jobs.get(&id).cloned()
    }

    pub fn completion(&self, aggregate_id: &str) -> Option<CompletionRecord> {
        self.lock().completions.get(aggregate_id).cloned()
    }

    fn stage_outbox(state: &mut StoreState, message: NewOutboxMessage) -> i64 {
        let id = state.next_outbox_id;
        state.next_outbox_id += 1;
        state
            .outbox
            .insert(id, OutboxMessage::from_new(id, message, Utc::now()));
        id
    }

    fn load(state: &StoreState, id: i64) -> Option<LoadedTransaction> {
        let transaction = state.transactions.get(&id)?.clone();
        let fund = state.funds.get(&transaction.fund_id).cloned();
        let security = transaction.security_id.and_then(|security_id| {
            state
                .securities
                .values()
                .find(|s| s.id == security_id)
                .cloned()
        });
        let sub_type = state.sub_types.get(&transaction.sub_type_id).map(|st| {
            let mut st = st.clone();
            st.transaction_type = state.types.get(&st.type_id).cloned();
            st
        });
        let status = state.statuses.get(&transaction.status.code()).cloned();
        Some(LoadedTransaction {
            transaction,
            fund,
            security,
            sub_type,
            status,
        })
    }

    fn pending_mut(state: &mut StoreState, id: i64) -> Result<&mut OutboxMessage> {
        state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Outbox message {} not found", id))
    }
}

#[async_trait]
impl LedgerStoreTrait for InMemoryStore {
    async fn find_by_idempotency_key(&self, key: Uuid) -> Result<Option<LedgerTransaction>> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .transaction_keys
            .get(&key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn record_transaction(
        &self,
        draft: &TransactionDraft,
        idempotency_key: Option<Uuid>,
        build_outbox: &TransactionOutboxBuilder,
    ) -> Result<RecordedTransaction> {
        self.check_available()?;
        let mut state = self.lock();

        if let Some(existing) = idempotency_key.and_then(|key| state.transaction_keys.get(&key)) {
            let transaction = state
                .transactions
                .get(existing)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Idempotency key points at missing transaction {}", existing))?;
            return Ok(RecordedTransaction {
                transaction,
                outbox_message_id: None,
                replayed: true,
            });
        }

        if !state.funds.contains_key(&draft.fund_id) {
            return Err(anyhow::anyhow!("Fund {} does not exist", draft.fund_id));
        }
        if !state.sub_types.contains_key(&draft.sub_type_id) {
            return Err(anyhow::anyhow!(
                "Transaction sub-type {} does not exist",
                draft.sub_type_id
            ));
        }
        if let Some(security_id) = draft.security_id {
            if !state.securities.values().any(|s| s.id == security_id) {
                return Err(anyhow::anyhow!("Security {} does not exist", security_id));
            }
        }

        // Build everything first so a mapping error leaves no trace.
        let id = state.next_transaction_id;
        let transaction = LedgerTransaction::from_draft(id, draft.clone(), Utc::now());
        state.transactions.insert(id, transaction.clone());
        let outbox_message = Self::load(&state, id)
            .ok_or_else(|| anyhow::anyhow!("Transaction {} vanished", id))
            .and_then(|loaded| build_outbox(&loaded));
        let outbox_message = match outbox_message {
            Ok(message) => message,
            Err(e) => {
                state.transactions.remove(&id);
                return Err(e);
            }
        };

        state.next_transaction_id += 1;
        if let Some(key) = idempotency_key {
            state.transaction_keys.insert(key, id);
        }
        let outbox_message_id = Self::stage_outbox(&mut state, outbox_message);

        Ok(RecordedTransaction {
            transaction,
            outbox_message_id: Some(outbox_message_id),
            replayed: false,
        })
    }

    async fn load_transaction(&self, id: i64) -> Result<Option<LoadedTransaction>> {
        self.check_available()?;
        Ok(Self::load(&self.lock(), id))
    }

    async fn update_status(
        &self,
        id: i64,
        expected: TransactionStatus,
        status: TransactionStatus,
    ) -> Result<bool> {
        self.check_available()?;
        let mut state = self.lock();
        match state.transactions.get_mut(&id) {
            Some(transaction) if transaction.status == expected => {
                transaction.status = status;
                transaction.updated_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CompletionStoreTrait for InMemoryStore {
    async fn record_completion(&self, record: &CompletionRecord) -> Result<bool> {
        self.check_available()?;
        let mut state = self.lock();
        if state.completions.contains_key(&record.aggregate_id) {
            return Ok(false);
        }
        state
            .completions
            .insert(record.aggregate_id.clone(), record.clone());

        if let (Ok(id), Some(status)) = (
            record.aggregate_id.parse::<i64>(),
            TransactionStatus::from_code(record.final_status),
        ) {
            if let Some(transaction) = state.transactions.get_mut(&id) {
                if transaction.status != status {
                    transaction.status = status;
                    transaction.updated_at = Some(Utc::now());
                }
            }
        }
        Ok(true)
    }

    async fn find_completion(&self, aggregate_id: &str) -> Result<Option<CompletionRecord>> {
        self.check_available()?;
        Ok(self.lock().completions.get(aggregate_id).cloned())
    }
}

#[async_trait]
impl OutboxRepositoryTrait for InMemoryStore {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        self.check_available()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.claim_lease)?;
        let mut state = self.lock();

        let claimable: Vec<i64> = state
            .outbox
            .values()
            .filter(|m| m.status == OutboxStatus::Pending)
            .filter(|m| state.claims.get(&m.id).map_or(true, |until| *until < now))
            .take(limit.max(0) as usize)
            .map(|m| m.id)
            .collect();

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            state.claims.insert(id, now + lease);
            if let Some(message) = state.outbox.get(&id) {
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, outbox_message_id: i64) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.claims.remove(&outbox_message_id);
        let message = Self::pending_mut(&mut state, outbox_message_id)?;
        if message.status == OutboxStatus::Pending {
            message.mark_published(Utc::now());
        }
        Ok(())
    }

    async fn record_failed_attempt(
        &self,
        outbox_message_id: i64,
        max_retry_count: i32,
        error_message: &str,
    ) -> Result<OutboxStatus> {
        self.check_available()?;
        let mut state = self.lock();
        state.claims.remove(&outbox_message_id);
        let message = Self::pending_mut(&mut state, outbox_message_id)?;
        if message.status != OutboxStatus::Pending {
            return Ok(message.status);
        }
        Ok(message.record_failure(error_message, max_retry_count))
    }

    async fn mark_failed(&self, outbox_message_id: i64, error_message: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.claims.remove(&outbox_message_id);
        let message = Self::pending_mut(&mut state, outbox_message_id)?;
        if message.status == OutboxStatus::Pending {
            message.mark_failed(error_message);
        }
        Ok(())
    }

    async fn requeue_failed(&self, outbox_message_id: i64) -> Result<bool> {
        self.check_available()?;
        let mut state = self.lock();
        Ok(state
            .outbox
            .get_mut(&outbox_message_id)
            .map(|message| message.reset_for_retry())
            .unwrap_or(false))
    }

    async fn find(&self, outbox_message_id: i64) -> Result<Option<OutboxMessage>> {
        self.check_available()?;
        Ok(self.lock().outbox.get(&outbox_message_id).cloned())
    }

    async fn count_by_status(&self) -> Result<OutboxStatusCounts> {
        self.check_available()?;
        let state = self.lock();
        let mut counts = OutboxStatusCounts::default();
        for message in state.outbox.values() {
            match message.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Published => counts.published += 1,
                OutboxStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl IdempotencyGuardTrait for InMemoryStore {
    async fn try_mark_processed(&self, key: &IdempotencyKey) -> Result<bool> {
        self.check_available()?;
        Ok(self.lock().processed.insert(key.to_string()))
    }

    async fn is_processed(&self, key: &IdempotencyKey) -> Result<bool> {
        self.check_available()?;
        Ok(self.lock().processed.contains(&key.to_string()))
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        self.check_available()?;
        self.lock().processed.remove(&key.to_string());
        Ok(())
    }
}

#[async_trait]
impl JobStoreTrait for InMemoryStore {
    async fn create_job_with_outbox(
        &self,
        job: &NewJob,
        build_outbox: &JobOutboxBuilder,
    ) -> Result<(JobRecord, i64)> {
        self.check_available()?;
        let mut state = self.lock();
        let record = job.clone().into_record(state.next_job_id, Utc::now());
        let outbox_message = build_outbox(&record)?;

        state.next_job_id += 1;
        state.jobs.insert(record.id, record.clone());
        let outbox_message_id = Self::stage_outbox(&mut state, outbox_message);
        Ok((record, outbox_message_id))
    }

    async fn find_job(&self, id: i64) -> Result<Option<JobRecord>> {
        self.check_available()?;
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn update_job_status(&self, id: i64, update: JobStatusUpdate) -> Result<JobRecord> {
        self.check_available()?;
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        job.apply(update);
        Ok(job.clone())
    }
}

#[async_trait]
impl InstrumentCatalogTrait for InMemoryStore {
    async fn count_staged(&self) -> Result<i64> {
        self.check_available()?;
        Ok(self.lock().staged.len() as i64)
    }

    async fn fetch_staged(&self, offset: i64, limit: i64) -> Result<Vec<StagedInstrument>> {
        self.check_available()?;
        let state = self.lock();
        let mut staged = state.staged.clone();
        staged.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(staged
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn upsert_securities(&self, instruments: &[StagedInstrument]) -> Result<UpsertCounts> {
        self.check_available()?;
        let mut state = self.lock();
        let mut counts = UpsertCounts::default();
        for instrument in instruments {
            let key = instrument.ticker_key();
            match state.securities.get_mut(&key) {
                Some(security) => {
                    security.name = instrument.name.trim().to_string();
                    counts.updated += 1;
                }
                None => {
                    let id = state.next_security_id;
                    state.next_security_id += 1;
                    state.securities.insert(
                        key.clone(),
                        Security {
                            id,
                            ticker: key,
                            name: instrument.name.trim().to_string(),
                        },
                    );
                    counts.created += 1;
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox_row(aggregate: &str) -> NewOutboxMessage {
        NewOutboxMessage {
            aggregate_id: aggregate.to_string(),
            event_type: "test".to_string(),
            queue: "q".to_string(),
            payload: vec![1],
            content_type: "application/json".to_string(),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_pending_respects_order_and_claims() {
        let store = InMemoryStore::new();
        for n in 0..3 {
            store.insert_outbox(outbox_row(&n.to_string()));
        }

        let first = store.fetch_pending(2).await.unwrap();
        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);

        let second = store.fetch_pending(10).await.unwrap();
        assert_eq!(second.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_failed_attempt_releases_claim() {
        let store = InMemoryStore::new();
        let id = store.insert_outbox(outbox_row("1"));
        store.fetch_pending(10).await.unwrap();

        let status = store.record_failed_attempt(id, 5, "boom").await.unwrap();
        assert_eq!(status, OutboxStatus::Pending);
        assert_eq!(store.fetch_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_guard_is_check_and_insert() {
        let store = InMemoryStore::new();
        let key = IdempotencyKey::new("c", "E", 1);
        assert!(store.try_mark_processed(&key).await.unwrap());
        assert!(!store.try_mark_processed(&key).await.unwrap());
        store.release(&key).await.unwrap();
        assert!(!store.is_processed(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(store.fetch_pending(1).await.is_err());
    }
}
