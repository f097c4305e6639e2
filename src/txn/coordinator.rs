//! Transaction coordinator
//!
//! One writer at a time, any number of readers. A write commit is:
//!
//! 1. `commit_prepare` on every component, each REDO payload journaled
//! 2. COMMIT marker written and the journal fsynced (the durable point)
//! 3. `commit` on every component, under the gate so no transaction can
//!    begin halfway through
//! 4. journal emptied, then `commit_end`
//!
//! A failure before step 2 aborts everything. A failure after it leaves the
//! journal in place so the next start redoes the transaction, and refuses
//! every later writer until then: a writer building on the unpublished state
//! would journal a root that replay lets overwrite the lost commit.
//!
//! Writers can be held off with [`block_writers`](TransactionCoordinator::block_writers),
//! and [`start_exclusive_mode`](TransactionCoordinator::start_exclusive_mode)
//! waits until no transaction of either kind is active and admits none until
//! [`finish_exclusive_mode`](TransactionCoordinator::finish_exclusive_mode).

use super::component::{ComponentId, TransactionalComponent, TxnId, TxnInfo, TxnType};
use crate::error::{Result, VaultError};
use crate::journal::{Journal, JournalEntry, JournalEntryType};
use crate::location::Location;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    active_readers: AtomicU64,
    active_writers: AtomicU64,
    begin: AtomicU64,
    begin_read: AtomicU64,
    begin_write: AtomicU64,
    finished: AtomicU64,
}

#[derive(Default)]
struct Quiesce {
    /// Transactions between begin and finish
    active: u64,
    exclusive: bool,
}

struct Shared {
    journal: Journal,
    components: RwLock<Vec<Arc<dyn TransactionalComponent>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
    /// Whether the writer slot is taken
    writer: Mutex<bool>,
    writer_free: Condvar,
    /// The writer slot is held by `block_writers`, not by a transaction
    writers_blocked: AtomicBool,
    quiesce: Mutex<Quiesce>,
    quiesce_changed: Condvar,
    /// Shared by `begin`, exclusive while a commit publishes
    gate: RwLock<()>,
    next_id: AtomicU64,
    data_version: AtomicU64,
    /// A commit failed after its durable point; keep the journal for recovery
    journal_pinned: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn components(&self) -> Vec<Arc<dyn TransactionalComponent>> {
        self.components.read().clone()
    }

    fn acquire_writer(&self, wait: bool) -> Result<()> {
        let mut taken = self.writer.lock();
        while *taken {
            if !wait {
                return Err(VaultError::WriterSlotBusy);
            }
            self.writer_free.wait(&mut taken);
        }
        *taken = true;
        Ok(())
    }

    fn release_writer(&self) {
        *self.writer.lock() = false;
        self.writer_free.notify_one();
    }

    fn block_writers(&self, wait: bool) -> Result<()> {
        self.acquire_writer(wait)?;
        self.writers_blocked.store(true, Ordering::Release);
        tracing::debug!("Writers blocked");
        Ok(())
    }

    fn enable_writers(&self) -> bool {
        if !self.writers_blocked.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.release_writer();
        tracing::debug!("Writers enabled");
        true
    }

    /// Count a transaction in, unless exclusive mode holds it off.
    fn enter(&self, wait: bool) -> Result<()> {
        let mut quiesce = self.quiesce.lock();
        while quiesce.exclusive {
            if !wait {
                return Err(VaultError::ExclusiveMode);
            }
            self.quiesce_changed.wait(&mut quiesce);
        }
        quiesce.active += 1;
        Ok(())
    }

    fn leave(&self) {
        let mut quiesce = self.quiesce.lock();
        quiesce.active -= 1;
        if quiesce.active == 0 {
            self.quiesce_changed.notify_all();
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VaultError::Shutdown);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(VaultError::NotStarted);
        }
        Ok(())
    }

    fn begin(self: &Arc<Self>, kind: TxnType, wait: bool) -> Result<Transaction> {
        self.check_running()?;
        if kind == TxnType::Write {
            self.acquire_writer(wait)?;
            if self.journal_pinned.load(Ordering::Acquire) {
                self.release_writer();
                return Err(VaultError::RecoveryPending);
            }
        }
        if let Err(e) = self.enter(wait) {
            if kind == TxnType::Write {
                self.release_writer();
            }
            return Err(e);
        }

        let components = self.components();
        let info = {
            let _gate = self.gate.read();
            let info = TxnInfo {
                id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                kind,
                data_version: self.data_version.load(Ordering::Acquire),
            };
            for (i, component) in components.iter().enumerate() {
                if let Err(e) = component.begin(&info) {
                    tracing::error!(
                        txn = info.id,
                        component = component.label(),
                        error = %e,
                        "Component failed to begin"
                    );
                    for started in &components[..i] {
                        if info.is_write() {
                            if let Err(e) = started.abort(&info) {
                                tracing::error!(component = started.label(), error = %e, "Rollback failed");
                            }
                        }
                        started.end(&info);
                    }
                    self.leave();
                    if info.is_write() {
                        self.release_writer();
                    }
                    return Err(e);
                }
            }
            info
        };

        let counters = &self.counters;
        counters.begin.fetch_add(1, Ordering::Relaxed);
        match kind {
            TxnType::Read => {
                counters.begin_read.fetch_add(1, Ordering::Relaxed);
                counters.active_readers.fetch_add(1, Ordering::Relaxed);
            }
            TxnType::Write => {
                counters.begin_write.fetch_add(1, Ordering::Relaxed);
                counters.active_writers.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::trace!(txn = info.id, ?kind, version = info.data_version, "Begin");

        Ok(Transaction {
            shared: Arc::clone(self),
            info,
            finished: AtomicBool::new(false),
        })
    }

    /// Last step of every transaction.
    fn finish(&self, info: &TxnInfo, components: &[Arc<dyn TransactionalComponent>]) {
        for component in components {
            component.end(info);
        }
        let counters = &self.counters;
        counters.finished.fetch_add(1, Ordering::Relaxed);
        match info.kind {
            TxnType::Read => {
                counters.active_readers.fetch_sub(1, Ordering::Relaxed);
            }
            TxnType::Write => {
                counters.active_writers.fetch_sub(1, Ordering::Relaxed);
                self.release_writer();
            }
        }
        self.leave();
    }

    fn commit(&self, info: &TxnInfo) -> Result<()> {
        let components = self.components();
        if !info.is_write() {
            self.finish(info, &components);
            return Ok(());
        }

        self.journal.start_write();
        if let Err(e) = self.prepare(info, &components) {
            tracing::warn!(txn = info.id, error = %e, "Commit preparation failed; aborting");
            if let Err(e) = self.journal.abort_write() {
                tracing::error!(txn = info.id, error = %e, "Failed to truncate the journal");
            }
            self.rollback(info, &components);
            self.finish(info, &components);
            return Err(e);
        }
        self.journal.commit_write();

        // Durable from here on
        let mut failed = Vec::new();
        {
            let _gate = self.gate.write();
            for component in &components {
                if let Err(e) = component.commit(info) {
                    tracing::warn!(
                        txn = info.id,
                        component = component.label(),
                        error = %e,
                        "Component commit failed; retrying"
                    );
                    if let Err(e) = component.commit(info) {
                        tracing::error!(
                            txn = info.id,
                            component = component.label(),
                            error = %e,
                            "Component commit failed again; journal kept for recovery"
                        );
                        failed.push(format!("{}: {}", component.label(), e));
                    }
                }
            }
            self.data_version.fetch_add(1, Ordering::AcqRel);
        }

        if !failed.is_empty() {
            tracing::error!(txn = info.id, "Writers refused until the journal is recovered");
            self.journal_pinned.store(true, Ordering::Release);
        }
        let result = if self.journal_pinned.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.journal.reset()
        };
        let result = result.and_then(|_| {
            for component in &components {
                component.commit_end(info)?;
            }
            Ok(())
        });
        self.finish(info, &components);
        tracing::debug!(txn = info.id, version = self.data_version.load(Ordering::Relaxed), "Committed");

        if !failed.is_empty() {
            return Err(VaultError::CommitFailed(failed.join("; ")));
        }
        result
    }

    fn prepare(&self, info: &TxnInfo, components: &[Arc<dyn TransactionalComponent>]) -> Result<()> {
        for component in components {
            if let Some(payload) = component.commit_prepare(info)? {
                self.journal
                    .write(JournalEntryType::Redo, component.component_id(), &payload)?;
            }
        }
        self.journal.write_journal(JournalEntryType::Commit)?;
        Ok(())
    }

    fn rollback(&self, info: &TxnInfo, components: &[Arc<dyn TransactionalComponent>]) {
        for component in components {
            if let Err(e) = component.abort(info) {
                tracing::error!(
                    txn = info.id,
                    component = component.label(),
                    error = %e,
                    "Rollback failed"
                );
            }
        }
    }

    fn abort(&self, info: &TxnInfo) -> Result<()> {
        let components = self.components();
        if info.is_write() {
            self.rollback(info, &components);
        }
        self.finish(info, &components);
        tracing::trace!(txn = info.id, "Aborted");
        Ok(())
    }
}

/// A transaction handle.
///
/// Consumed by [`commit`](Transaction::commit) or
/// [`abort`](Transaction::abort). Dropping an unfinished transaction aborts
/// it.
pub struct Transaction {
    shared: Arc<Shared>,
    info: TxnInfo,
    finished: AtomicBool,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.info.id
    }

    pub fn kind(&self) -> TxnType {
        self.info.kind
    }

    pub fn is_write(&self) -> bool {
        self.info.is_write()
    }

    /// Data version this transaction started from.
    pub fn data_version(&self) -> u64 {
        self.info.data_version
    }

    pub fn info(&self) -> &TxnInfo {
        &self.info
    }

    pub fn is_active(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }

    /// The transaction, if it is still active.
    pub(crate) fn check_active(&self) -> Result<&TxnInfo> {
        if !self.is_active() {
            return Err(VaultError::TransactionFinished);
        }
        Ok(&self.info)
    }

    /// The transaction, if it is still active and may write.
    pub(crate) fn check_write(&self) -> Result<&TxnInfo> {
        let info = self.check_active()?;
        if !info.is_write() {
            return Err(VaultError::ReadOnlyTransaction);
        }
        Ok(info)
    }

    fn mark_finished(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(VaultError::TransactionFinished);
        }
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.mark_finished()?;
        self.shared.commit(&self.info)
    }

    pub fn abort(self) -> Result<()> {
        self.mark_finished()?;
        self.shared.abort(&self.info)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.mark_finished().is_ok() {
            tracing::warn!(txn = self.info.id, kind = ?self.info.kind, "Transaction dropped while active; aborting");
            if let Err(e) = self.shared.abort(&self.info) {
                tracing::error!(txn = self.info.id, error = %e, "Abort on drop failed");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.info.id)
            .field("kind", &self.info.kind)
            .field("data_version", &self.info.data_version)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Runs transactions over a set of components sharing one journal.
pub struct TransactionCoordinator {
    shared: Arc<Shared>,
}

impl TransactionCoordinator {
    /// Coordinator with the journal of `location`.
    pub fn new(location: &Location) -> Result<Self> {
        Ok(Self::with_journal(Journal::open_in(location)?))
    }

    pub fn with_journal(journal: Journal) -> Self {
        TransactionCoordinator {
            shared: Arc::new(Shared {
                journal,
                components: RwLock::new(Vec::new()),
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                writer: Mutex::new(false),
                writer_free: Condvar::new(),
                writers_blocked: AtomicBool::new(false),
                quiesce: Mutex::new(Quiesce::default()),
                quiesce_changed: Condvar::new(),
                gate: RwLock::new(()),
                next_id: AtomicU64::new(0),
                data_version: AtomicU64::new(0),
                journal_pinned: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.shared.journal
    }

    fn check_setup(&self) -> Result<()> {
        if self.shared.started.load(Ordering::Acquire) {
            return Err(VaultError::AlreadyStarted);
        }
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(VaultError::Shutdown);
        }
        Ok(())
    }

    /// Register a component. Only before [`start`](Self::start).
    pub fn add(&self, component: Arc<dyn TransactionalComponent>) -> Result<()> {
        self.check_setup()?;
        let mut components = self.shared.components.write();
        let id = component.component_id();
        if components.iter().any(|c| c.component_id() == id) {
            return Err(VaultError::DuplicateComponent(format!(
                "{} ({})",
                component.label(),
                id
            )));
        }
        tracing::debug!(component = component.label(), %id, "Added component");
        components.push(component);
        Ok(())
    }

    /// Unregister a component. Only before [`start`](Self::start).
    pub fn remove(&self, id: ComponentId) -> Result<Option<Arc<dyn TransactionalComponent>>> {
        self.check_setup()?;
        let mut components = self.shared.components.write();
        Ok(components
            .iter()
            .position(|c| c.component_id() == id)
            .map(|i| components.remove(i)))
    }

    /// Recover from the journal and open for business.
    pub fn start(&self) -> Result<()> {
        self.check_setup()?;
        self.recover()?;
        self.shared.started.store(true, Ordering::Release);
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let components = self.shared.components();
        let journal = &self.shared.journal;
        let scan = journal.scan()?;

        if scan.entries.is_empty() {
            if scan.has_torn_tail() {
                journal.reset()?;
            }
            for component in &components {
                component.clean_start()?;
            }
            return Ok(());
        }

        tracing::info!(entries = scan.entries.len(), "Journal recovery start");
        for component in &components {
            component.start_recovery()?;
        }

        let replayed = match Self::replay_journal(&components, scan.entries) {
            Ok(replayed) => replayed,
            Err(e) => {
                tracing::error!(error = %e, "Journal recovery failed; journal kept");
                // Leave no component in recovery mode
                for component in &components {
                    if let Err(fe) = component.finish_recovery() {
                        tracing::error!(component = component.label(), error = %fe, "Finish recovery failed");
                    }
                }
                return Err(e);
            }
        };

        for component in &components {
            component.finish_recovery()?;
        }
        journal.reset()?;
        tracing::info!(transactions = replayed, "Journal recovery end");
        Ok(())
    }

    fn replay_journal(
        components: &[Arc<dyn TransactionalComponent>],
        entries: Vec<JournalEntry>,
    ) -> Result<u64> {
        let mut group: Vec<JournalEntry> = Vec::new();
        let mut replayed = 0u64;
        for entry in entries {
            match entry.kind {
                JournalEntryType::Abort => group.clear(),
                JournalEntryType::Commit => {
                    Self::replay(components, &group)?;
                    group.clear();
                    replayed += 1;
                }
                JournalEntryType::Redo | JournalEntryType::Undo => group.push(entry),
            }
        }
        if !group.is_empty() {
            tracing::info!(entries = group.len(), "Discarding incomplete transaction");
        }
        Ok(replayed)
    }

    fn replay(components: &[Arc<dyn TransactionalComponent>], group: &[JournalEntry]) -> Result<()> {
        for entry in group {
            if entry.kind == JournalEntryType::Undo {
                tracing::warn!(component = %entry.component, "UNDO entry not handled");
                continue;
            }
            if entry.component == ComponentId::NIL {
                return Err(VaultError::JournalCorrupt(
                    "REDO entry without a component id".into(),
                ));
            }
            match components.iter().find(|c| c.component_id() == entry.component) {
                Some(component) => component.recover(&entry.payload)?,
                None => tracing::warn!(component = %entry.component, "No component for journal entry"),
            }
        }
        Ok(())
    }

    /// Start a transaction. A writer waits for the writer slot.
    pub fn begin(&self, kind: TxnType) -> Result<Transaction> {
        self.shared.begin(kind, true)
    }

    /// Start a transaction, failing with [`VaultError::WriterSlotBusy`]
    /// instead of waiting.
    pub fn try_begin(&self, kind: TxnType) -> Result<Transaction> {
        self.shared.begin(kind, false)
    }

    /// Run `f` in a read transaction.
    pub fn exec_read<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        self.exec(TxnType::Read, f)
    }

    /// Run `f` in a write transaction: commit on `Ok`, abort on `Err`.
    pub fn exec_write<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        self.exec(TxnType::Write, f)
    }

    fn exec<T>(&self, kind: TxnType, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let txn = self.begin(kind)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::error!(error = %abort_err, "Abort after failed closure failed");
                }
                Err(e)
            }
        }
    }

    /// Hold the writer slot so no write transaction can begin. Waits for an
    /// active writer to finish. Readers are unaffected.
    pub fn block_writers(&self) -> Result<()> {
        self.shared.check_running()?;
        self.shared.block_writers(true)
    }

    /// Like [`block_writers`](Self::block_writers), but `false` instead of
    /// waiting when a writer is active.
    pub fn try_block_writers(&self) -> Result<bool> {
        self.shared.check_running()?;
        match self.shared.block_writers(false) {
            Ok(()) => Ok(true),
            Err(VaultError::WriterSlotBusy) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Undo [`block_writers`](Self::block_writers).
    pub fn enable_writers(&self) {
        if !self.shared.enable_writers() {
            tracing::warn!("enable_writers called while writers were not blocked");
        }
    }

    /// Run `f` with writers blocked. Readers carry on.
    pub fn exec_as_writer<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.block_writers()?;
        let result = f();
        self.enable_writers();
        result
    }

    /// Wait until no transaction is active, then admit none until
    /// [`finish_exclusive_mode`](Self::finish_exclusive_mode). Must not be
    /// called from a thread that holds an active transaction.
    pub fn start_exclusive_mode(&self) -> Result<()> {
        self.block_writers()?;
        let shared = &self.shared;
        let mut quiesce = shared.quiesce.lock();
        quiesce.exclusive = true;
        while quiesce.active > 0 {
            shared.quiesce_changed.wait(&mut quiesce);
        }
        tracing::debug!("Exclusive mode started");
        Ok(())
    }

    /// Enter exclusive mode only if no transaction is active right now.
    pub fn try_exclusive_mode(&self) -> Result<bool> {
        if !self.try_block_writers()? {
            return Ok(false);
        }
        let mut quiesce = self.shared.quiesce.lock();
        if quiesce.active > 0 {
            drop(quiesce);
            self.enable_writers();
            return Ok(false);
        }
        quiesce.exclusive = true;
        tracing::debug!("Exclusive mode started");
        Ok(true)
    }

    pub fn finish_exclusive_mode(&self) {
        {
            let mut quiesce = self.shared.quiesce.lock();
            if !quiesce.exclusive {
                tracing::warn!("finish_exclusive_mode called outside exclusive mode");
                return;
            }
            quiesce.exclusive = false;
            self.shared.quiesce_changed.notify_all();
        }
        self.enable_writers();
        tracing::debug!("Exclusive mode finished");
    }

    pub fn is_exclusive_mode(&self) -> bool {
        self.shared.quiesce.lock().exclusive
    }

    /// Run `f` while no transaction can be active.
    pub fn exec_exclusive<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.start_exclusive_mode()?;
        let result = f();
        self.finish_exclusive_mode();
        result
    }

    /// Shut down every component and close the journal.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = None;
        for component in self.shared.components() {
            if let Err(e) = component.shutdown() {
                tracing::error!(component = component.label(), error = %e, "Shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.shared.journal.close() {
            first_err.get_or_insert(e);
        }
        tracing::debug!("Coordinator shut down");
        first_err.map_or(Ok(()), Err)
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    pub fn data_version(&self) -> u64 {
        self.shared.data_version.load(Ordering::Acquire)
    }

    pub fn count_active_readers(&self) -> u64 {
        self.shared.counters.active_readers.load(Ordering::Relaxed)
    }

    pub fn count_active_writers(&self) -> u64 {
        self.shared.counters.active_writers.load(Ordering::Relaxed)
    }

    pub fn count_begin(&self) -> u64 {
        self.shared.counters.begin.load(Ordering::Relaxed)
    }

    pub fn count_begin_read(&self) -> u64 {
        self.shared.counters.begin_read.load(Ordering::Relaxed)
    }

    pub fn count_begin_write(&self) -> u64 {
        self.shared.counters.begin_write.load(Ordering::Relaxed)
    }

    pub fn count_finished(&self) -> u64 {
        self.shared.counters.finished.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("started", &self.is_started())
            .field("data_version", &self.data_version())
            .field("components", &self.shared.components.read().len())
            .finish()
    }
}
