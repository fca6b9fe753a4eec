//! Invoice (nota fiscal) records and their binding to shipments.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sled::Transactional;
use sled::transaction::TransactionalTree;
use tracing::{debug, info};

use crate::error::{Result, WorkflowError};
use crate::policy::{Action, Resource, ShipmentState, authorize};
use crate::shipment::Shipment;
use crate::store::{self, Store, TxResult, tx_load, tx_save};
use crate::types::{Actor, TimeStamp};
use crate::utils::{INVOICE_HRP, new_id};
use crate::validators::{ensure_valid, parse_money, validate_required};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub code: String, // access key printed on the document
    #[n(2)]
    pub number: String,
    #[n(3)]
    pub value_cents: u64,
    #[n(4)]
    pub volumes: u32,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub shipment_id: Option<String>,
}

impl Invoice {
    pub fn is_bound(&self) -> bool {
        self.shipment_id.is_some()
    }
}

/// Raw invoice input as typed or scanned.
#[derive(Debug, Clone, Default)]
pub struct NewInvoice {
    pub code: String,
    pub number: String,
    pub value: String,
    pub volumes: u32,
}

impl NewInvoice {
    pub fn new(code: &str, number: &str, value: &str, volumes: u32) -> Self {
        Self {
            code: code.trim().to_string(),
            number: number.trim().to_string(),
            value: value.to_string(),
            volumes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindingFilter {
    #[default]
    All,
    Unbound,
    Bound,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// partial, case insensitive match on code or number
    pub search: Option<String>,
    pub binding: BindingFilter,
}

impl InvoiceFilter {
    fn matches(&self, invoice: &Invoice) -> bool {
        let created = invoice.created_at.to_datetime_utc();
        if self.from.is_some_and(|from| created < from) || self.to.is_some_and(|to| created > to) {
            return false;
        }

        let binding = match self.binding {
            BindingFilter::All => true,
            BindingFilter::Unbound => !invoice.is_bound(),
            BindingFilter::Bound => invoice.is_bound(),
        };

        let search = match self.search.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(term) => {
                let term = term.to_lowercase();
                invoice.code.to_lowercase().contains(&term)
                    || invoice.number.to_lowercase().contains(&term)
            }
        };

        binding && search
    }
}

fn code_key(code: &str) -> String {
    format!("code:{code}")
}

fn number_key(number: &str) -> String {
    format!("number:{number}")
}

// Each key maps to the ids of every unbound invoice carrying that code or number.
// An empty holder list is removed, so a present key always means a live duplicate.
fn claim_keys(keys: &TransactionalTree, invoice: &Invoice) -> TxResult<()> {
    for key in [code_key(&invoice.code), number_key(&invoice.number)] {
        let mut holders: Vec<String> = tx_load(keys, &key)?.unwrap_or_default();
        if !holders.contains(&invoice.id) {
            holders.push(invoice.id.clone());
            tx_save(keys, &key, &holders)?;
        }
    }
    Ok(())
}

fn release_keys(keys: &TransactionalTree, invoice: &Invoice) -> TxResult<()> {
    for key in [code_key(&invoice.code), number_key(&invoice.number)] {
        let Some(mut holders) = tx_load::<Vec<String>>(keys, &key)? else {
            continue;
        };
        holders.retain(|id| *id != invoice.id);
        if holders.is_empty() {
            keys.remove(key.as_str())?;
        } else {
            tx_save(keys, &key, &holders)?;
        }
    }
    Ok(())
}

/// Bind one invoice to `shipment`, which the caller saves afterwards.
pub(crate) fn bind_in_tx(
    invoices: &TransactionalTree,
    keys: &TransactionalTree,
    invoice_id: &str,
    shipment: &mut Shipment,
) -> TxResult<Invoice> {
    let mut invoice: Invoice = tx_load(invoices, invoice_id)?
        .ok_or_else(|| WorkflowError::not_found("invoice", invoice_id))?;

    if let Some(current) = &invoice.shipment_id {
        return Err(WorkflowError::Conflict(format!(
            "invoice {} is already bound to shipment {current}",
            invoice.number
        ))
        .into());
    }

    invoice.shipment_id = Some(shipment.id.clone());
    release_keys(keys, &invoice)?;
    tx_save(invoices, invoice_id, &invoice)?;

    if !shipment.invoice_ids.iter().any(|id| id == invoice_id) {
        shipment.invoice_ids.push(invoice_id.to_string());
    }

    Ok(invoice)
}

/// Clear the binding of one invoice and drop it from `shipment`.
/// Returns `None` when the invoice record no longer exists.
pub(crate) fn unbind_in_tx(
    invoices: &TransactionalTree,
    keys: &TransactionalTree,
    invoice_id: &str,
    shipment: &mut Shipment,
) -> TxResult<Option<Invoice>> {
    shipment.invoice_ids.retain(|id| id != invoice_id);

    let Some(mut invoice) = tx_load::<Invoice>(invoices, invoice_id)? else {
        return Ok(None);
    };

    if invoice.shipment_id.as_deref() == Some(shipment.id.as_str()) {
        invoice.shipment_id = None;
        claim_keys(keys, &invoice)?;
        tx_save(invoices, invoice_id, &invoice)?;
    }

    Ok(Some(invoice))
}

pub struct InvoiceRegistry {
    store: Arc<Store>,
}

impl InvoiceRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register a new invoice in the unbound working set.
    pub fn create(&self, actor: &Actor, input: NewInvoice) -> Result<Invoice> {
        authorize(actor, Action::CreateInvoice, Resource::None)?;

        ensure_valid(validate_required(&[
            ("code", Some(input.code.as_str())),
            ("number", Some(input.number.as_str())),
        ]))?;
        let value_cents = parse_money("value", &input.value)?;

        let invoice = Invoice {
            id: new_id(INVOICE_HRP)?,
            code: input.code,
            number: input.number,
            value_cents,
            volumes: input.volumes,
            created_at: TimeStamp::new(),
            shipment_id: None,
        };

        (&self.store.invoices, &self.store.invoice_keys).transaction(|(invoices, keys)| -> TxResult<()> {
            if keys.get(code_key(&invoice.code).as_str())?.is_some() {
                return Err(WorkflowError::Conflict(format!(
                    "invoice code {} was already added",
                    invoice.code
                ))
                .into());
            }
            if keys.get(number_key(&invoice.number).as_str())?.is_some() {
                return Err(WorkflowError::Conflict(format!(
                    "invoice number {} was already added",
                    invoice.number
                ))
                .into());
            }

            tx_save(invoices, &invoice.id, &invoice)?;
            claim_keys(keys, &invoice)?;
            Ok(())
        })?;

        info!(invoice = %invoice.id, number = %invoice.number, "invoice created");
        Ok(invoice)
    }

    pub fn get(&self, actor: &Actor, invoice_id: &str) -> Result<Invoice> {
        authorize(actor, Action::Read, Resource::None)?;
        store::load(&self.store.invoices, invoice_id)?
            .ok_or_else(|| WorkflowError::not_found("invoice", invoice_id))
    }

    /// Newest first.
    pub fn list(&self, actor: &Actor, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        authorize(actor, Action::Read, Resource::None)?;

        let mut invoices: Vec<Invoice> = store::load_all::<Invoice>(&self.store.invoices)?
            .into_iter()
            .filter(|invoice| filter.matches(invoice))
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        debug!(count = invoices.len(), ?filter, "invoices listed");
        Ok(invoices)
    }

    pub fn bind(&self, actor: &Actor, invoice_id: &str, shipment_id: &str) -> Result<Invoice> {
        let tx_trees = (
            &self.store.invoices,
            &self.store.invoice_keys,
            &self.store.shipments,
        );

        let invoice = tx_trees.transaction(|(invoices, keys, shipments)| -> TxResult<Invoice> {
            let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;

            authorize(actor, Action::BindInvoice, Resource::Shipment(shipment.state()))?;
            if shipment.finalized {
                return Err(WorkflowError::InvalidState(format!(
                    "shipment {shipment_id} is finalized"
                ))
                .into());
            }

            let invoice = bind_in_tx(invoices, keys, invoice_id, &mut shipment)?;
            tx_save(shipments, shipment_id, &shipment)?;
            Ok(invoice)
        })?;

        info!(invoice = invoice_id, shipment = shipment_id, "invoice bound");
        Ok(invoice)
    }

    pub fn unbind(&self, actor: &Actor, invoice_id: &str) -> Result<Invoice> {
        let tx_trees = (
            &self.store.invoices,
            &self.store.invoice_keys,
            &self.store.shipments,
        );

        let invoice = tx_trees.transaction(|(invoices, keys, shipments)| -> TxResult<Invoice> {
            let invoice: Invoice = tx_load(invoices, invoice_id)?
                .ok_or_else(|| WorkflowError::not_found("invoice", invoice_id))?;
            let Some(shipment_id) = invoice.shipment_id.as_deref() else {
                return Err(WorkflowError::InvalidState(format!(
                    "invoice {} is not bound to a shipment",
                    invoice.number
                ))
                .into());
            };

            let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;

            authorize(actor, Action::BindInvoice, Resource::Shipment(shipment.state()))?;
            if shipment.finalized {
                return Err(WorkflowError::InvalidState(format!(
                    "shipment {shipment_id} is finalized"
                ))
                .into());
            }

            let invoice = unbind_in_tx(invoices, keys, invoice_id, &mut shipment)?
                .ok_or_else(|| WorkflowError::not_found("invoice", invoice_id))?;
            tx_save(shipments, shipment_id, &shipment)?;
            Ok(invoice)
        })?;

        info!(invoice = invoice_id, "invoice unbound");
        Ok(invoice)
    }

    pub fn delete(&self, actor: &Actor, invoice_id: &str) -> Result<()> {
        let tx_trees = (
            &self.store.invoices,
            &self.store.invoice_keys,
            &self.store.shipments,
        );

        tx_trees.transaction(|(invoices, keys, shipments)| -> TxResult<()> {
            let invoice: Invoice = tx_load(invoices, invoice_id)?
                .ok_or_else(|| WorkflowError::not_found("invoice", invoice_id))?;

            let shipment = match invoice.shipment_id.as_deref() {
                Some(shipment_id) => tx_load::<Shipment>(shipments, shipment_id)?,
                None => None,
            };
            let resource = Resource::Invoice {
                bound: invoice.is_bound(),
                shipment: shipment.as_ref().map(Shipment::state),
            };
            authorize(actor, Action::DeleteInvoice, resource)?;

            if let Some(mut shipment) = shipment {
                if shipment.state() == ShipmentState::Finalized {
                    return Err(WorkflowError::InvalidState(format!(
                        "invoice {} belongs to a finalized shipment",
                        invoice.number
                    ))
                    .into());
                }
                shipment.invoice_ids.retain(|id| id != invoice_id);
                tx_save(shipments, &shipment.id, &shipment)?;
            }

            release_keys(keys, &invoice)?;
            invoices.remove(invoice_id)?;
            Ok(())
        })?;

        info!(invoice = invoice_id, user = %actor.user_id, "invoice deleted");
        Ok(())
    }
}
