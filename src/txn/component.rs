//! Component identity and the contract between coordinator and components

use crate::error::Result;
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// Transaction id, unique within one coordinator.
pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnType {
    Read,
    Write,
}

/// Identifies a component in journal entries.
///
/// Ids built with [`from_name`](ComponentId::from_name) are stable across
/// restarts, so recovery can route REDO entries back to their component.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId([u8; ComponentId::LEN]);

impl ComponentId {
    pub const LEN: usize = 16;

    /// All zeros. Used by commit and abort markers.
    pub const NIL: ComponentId = ComponentId([0; ComponentId::LEN]);

    /// Stable id derived from a label.
    pub fn from_name(label: &str) -> Self {
        ComponentId(xxh3_128(label.as_bytes()).to_be_bytes())
    }

    /// Process-unique random id. Not suitable for anything journaled across
    /// restarts.
    pub fn random() -> Self {
        ComponentId(rand::random::<u128>().to_be_bytes())
    }

    pub fn from_bytes(bytes: [u8; ComponentId::LEN]) -> Self {
        ComponentId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(ComponentId)
    }

    pub fn as_bytes(&self) -> &[u8; ComponentId::LEN] {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self)
    }
}

/// What a component learns about the transaction it is taking part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnInfo {
    pub id: TxnId,
    pub kind: TxnType,
    /// Data version when the transaction began
    pub data_version: u64,
}

impl TxnInfo {
    pub fn is_write(&self) -> bool {
        self.kind == TxnType::Write
    }
}

/// A piece of state that commits and recovers under a coordinator.
///
/// Call order for one transaction is `begin`, then for a writer
/// `commit_prepare`, `commit`, `commit_end` or just `abort`, and finally
/// `end` for every transaction. A reader only sees `begin` and `end`.
pub trait TransactionalComponent: Send + Sync {
    fn component_id(&self) -> ComponentId;

    /// Human readable name for logs.
    fn label(&self) -> &str;

    /// Recovery is about to replay committed entries.
    fn start_recovery(&self) -> Result<()>;

    /// Apply the REDO payload of one committed transaction.
    fn recover(&self, payload: &[u8]) -> Result<()>;

    fn finish_recovery(&self) -> Result<()>;

    /// Startup found nothing to recover.
    fn clean_start(&self) -> Result<()>;

    fn begin(&self, txn: &TxnInfo) -> Result<()>;

    /// Make staged changes ready to publish. The returned bytes are
    /// journaled as this component's REDO entry; `None` writes nothing.
    fn commit_prepare(&self, txn: &TxnInfo) -> Result<Option<Vec<u8>>>;

    /// Publish the prepared state. Runs after the journal is durable.
    fn commit(&self, txn: &TxnInfo) -> Result<()>;

    /// The journal no longer holds this transaction.
    fn commit_end(&self, txn: &TxnInfo) -> Result<()>;

    /// Discard staged changes.
    fn abort(&self, txn: &TxnInfo) -> Result<()>;

    /// The transaction is over; drop anything kept for it.
    fn end(&self, txn: &TxnInfo);

    fn shutdown(&self) -> Result<()>;
}
