//! One handle over every workflow service sharing a single store.
use std::sync::Arc;

use tracing::info;

use crate::config::WorkflowConfig;
use crate::error::Result;
use crate::invoice::InvoiceRegistry;
use crate::order::OrderWorkflow;
use crate::scoring::{ScoringLedger, ScoringPolicy};
use crate::shipment::ShipmentService;
use crate::store::Store;
use crate::users::UserDirectory;

pub struct Workflow {
    pub invoices: InvoiceRegistry,
    pub shipments: ShipmentService,
    pub orders: OrderWorkflow,
    pub scoring: ScoringLedger,
    pub users: UserDirectory,
    store: Arc<Store>,
}

impl Workflow {
    pub fn new(store: Arc<Store>, config: &WorkflowConfig) -> Self {
        Self {
            invoices: InvoiceRegistry::new(store.clone()),
            shipments: ShipmentService::new(store.clone(), config.signatures.max_bytes),
            orders: OrderWorkflow::new(store.clone(), ScoringPolicy::from(&config.scoring)),
            scoring: ScoringLedger::new(store.clone()),
            users: UserDirectory::new(store.clone()),
            store,
        }
    }

    /// Open the database named in the config.
    pub fn open(config: &WorkflowConfig) -> Result<Self> {
        let store = Store::open(&config.database.path)?;
        info!(path = %config.database.path.display(), "workflow store opened");
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}
