//! sled backed persistence. One tree per record kind, CBOR values.
use std::path::Path;
use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::{Db, Tree};

use crate::error::{Result, WorkflowError};

pub struct Store {
    pub(crate) db: Arc<Db>,
    pub(crate) invoices: Tree,
    // "code:<code>" / "number:<number>" -> ids of the unbound invoices carrying it
    pub(crate) invoice_keys: Tree,
    pub(crate) shipments: Tree,
    pub(crate) orders: Tree,
    pub(crate) order_numbers: Tree,
    // keyed by order id
    pub(crate) reviews: Tree,
    pub(crate) score_events: Tree,
    pub(crate) leaderboard: Tree,
    pub(crate) users: Tree,
}

impl Store {
    pub fn new(db: Arc<Db>) -> Result<Self> {
        Ok(Self {
            invoices: db.open_tree("invoices")?,
            invoice_keys: db.open_tree("invoice_keys")?,
            shipments: db.open_tree("shipments")?,
            orders: db.open_tree("orders")?,
            order_numbers: db.open_tree("order_numbers")?,
            reviews: db.open_tree("reviews")?,
            score_events: db.open_tree("score_events")?,
            leaderboard: db.open_tree("leaderboard")?,
            users: db.open_tree("users")?,
            db,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::new(Arc::new(db))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    minicbor::to_vec(value).map_err(WorkflowError::internal)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(WorkflowError::internal)
}

/// Read and decode a record outside a transaction.
pub(crate) fn load<T>(tree: &Tree, key: &str) -> Result<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
}

/// Decode every value of a tree.
pub(crate) fn load_all<T>(tree: &Tree) -> Result<Vec<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    tree.iter()
        .values()
        .map(|bytes| decode(&bytes?))
        .collect()
}

pub(crate) type TxResult<T> = std::result::Result<T, ConflictableTransactionError<WorkflowError>>;

/// Read and decode a record inside a transaction.
pub(crate) fn tx_load<T>(tree: &TransactionalTree, key: &str) -> TxResult<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn tx_save<T: minicbor::Encode<()>>(
    tree: &TransactionalTree,
    key: &str,
    value: &T,
) -> TxResult<()> {
    tree.insert(key, encode(value)?)?;
    Ok(())
}
