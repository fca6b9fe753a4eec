//! Shipment (controle de carga) records and the open -> finalized lifecycle.
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use sled::Transactional;
use tracing::{debug, info, warn};

use crate::error::{FieldError, Result, WorkflowError};
use crate::invoice::{Invoice, bind_in_tx, unbind_in_tx};
use crate::order::Order;
use crate::policy::{Action, Resource, ShipmentState, authorize};
use crate::store::{self, Store, TxResult, tx_load, tx_save};
use crate::types::{Actor, TimeStamp};
use crate::utils::{SHIPMENT_HRP, new_id};
use crate::validators::{ensure_valid, validate_required, validate_tax_id};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    #[n(0)]
    Own,
    #[n(1)]
    Correios,
    #[n(2)]
    Jadlog,
    #[n(3)]
    Braspress,
    #[n(4)]
    TntMercurio,
    #[n(5)]
    Other,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    #[n(0)]
    pub image: String, // data url as received
    #[n(1)]
    pub digest: String, // sha256 of the decoded image bytes
    #[n(2)]
    pub signed_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRole {
    Driver,
    Responsible,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub driver_name: String,
    #[n(2)]
    pub driver_tax_id: String, // 11 bare digits
    #[n(3)]
    pub responsible_name: String,
    #[n(4)]
    pub carrier: Carrier,
    #[n(5)]
    pub pallets: u32,
    #[n(6)]
    pub note: Option<String>,
    #[n(7)]
    pub manifest: Option<String>,
    #[n(8)]
    pub finalized: bool,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub owner_id: String,
    #[n(11)]
    pub invoice_ids: Vec<String>,
    #[n(12)]
    pub driver_signature: Option<Signature>,
    #[n(13)]
    pub responsible_signature: Option<Signature>,
    #[n(14)]
    pub finalized_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub order_ids: Vec<String>,
}

impl Shipment {
    pub fn state(&self) -> ShipmentState {
        if self.finalized {
            ShipmentState::Finalized
        } else {
            ShipmentState::Open
        }
    }
}

// Used for constructing new shipments before they are validated
#[derive(Debug, Clone, Default)]
pub struct ShipmentDraft {
    driver_name: Option<String>,
    driver_tax_id: Option<String>,
    responsible_name: Option<String>,
    carrier: Option<Carrier>,
    pallets: u32,
    note: Option<String>,
    manifest: Option<String>,
    invoice_ids: Vec<String>,
}

impl ShipmentDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_driver_name(mut self, name: &str) -> Self {
        self.driver_name = Some(name.trim().to_string());
        self
    }
    pub fn set_driver_tax_id(mut self, tax_id: &str) -> Self {
        self.driver_tax_id = Some(tax_id.to_string());
        self
    }
    pub fn set_responsible_name(mut self, name: &str) -> Self {
        self.responsible_name = Some(name.trim().to_string());
        self
    }
    pub fn set_carrier(mut self, carrier: Carrier) -> Self {
        self.carrier = Some(carrier);
        self
    }
    pub fn set_pallets(mut self, pallets: u32) -> Self {
        self.pallets = pallets;
        self
    }
    pub fn set_note(mut self, note: &str) -> Self {
        self.note = non_blank(note);
        self
    }
    pub fn set_manifest(mut self, manifest: &str) -> Self {
        self.manifest = non_blank(manifest);
        self
    }
    pub fn add_invoice(mut self, invoice_id: &str) -> Self {
        self.invoice_ids.push(invoice_id.to_string());
        self
    }

    // Checks every field and returns the shipment record with its invoice list still empty.
    fn validate_and_finalise(&self, id: String, owner_id: &str) -> Result<Shipment> {
        let mut errors = validate_required(&[
            ("driver_name", self.driver_name.as_deref()),
            ("driver_tax_id", self.driver_tax_id.as_deref()),
            ("responsible_name", self.responsible_name.as_deref()),
        ]);
        if self.carrier.is_none() {
            errors.push(FieldError::new("carrier", "is required"));
        }

        let tax_id = match self.driver_tax_id.as_deref().map(validate_tax_id) {
            Some(Ok(digits)) => digits,
            Some(Err(reason)) => {
                errors.push(FieldError::new("driver_tax_id", reason.to_string()));
                String::new()
            }
            None => String::new(),
        };
        ensure_valid(errors)?;

        Ok(Shipment {
            id,
            driver_name: self.driver_name.clone().unwrap_or_default(),
            driver_tax_id: tax_id,
            responsible_name: self.responsible_name.clone().unwrap_or_default(),
            carrier: self.carrier.unwrap_or(Carrier::Other),
            pallets: self.pallets,
            note: self.note.clone(),
            manifest: self.manifest.clone(),
            finalized: false,
            created_at: TimeStamp::new(),
            owner_id: owner_id.to_string(),
            invoice_ids: vec![],
            driver_signature: None,
            responsible_signature: None,
            finalized_at: None,
            order_ids: vec![],
        })
    }
}

fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Field changes for [`ShipmentService::update`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ShipmentUpdate {
    pub driver_name: Option<String>,
    pub driver_tax_id: Option<String>,
    pub responsible_name: Option<String>,
    pub carrier: Option<Carrier>,
    pub pallets: Option<u32>,
    pub note: Option<String>,
    pub manifest: Option<String>,
    /// Replaces the full invoice membership.
    pub invoice_ids: Option<Vec<String>>,
}

impl ShipmentUpdate {
    fn apply(&self, shipment: &mut Shipment) -> Result<()> {
        let mut errors = validate_required(&[
            ("driver_name", self.driver_name.as_deref().or(Some(shipment.driver_name.as_str()))),
            (
                "responsible_name",
                self.responsible_name
                    .as_deref()
                    .or(Some(shipment.responsible_name.as_str())),
            ),
        ]);

        let tax_id = match self.driver_tax_id.as_deref() {
            Some(raw) => match validate_tax_id(raw) {
                Ok(digits) => Some(digits),
                Err(reason) => {
                    errors.push(FieldError::new("driver_tax_id", reason.to_string()));
                    None
                }
            },
            None => None,
        };
        ensure_valid(errors)?;

        if let Some(name) = &self.driver_name {
            shipment.driver_name = name.trim().to_string();
        }
        if let Some(tax_id) = tax_id {
            shipment.driver_tax_id = tax_id;
        }
        if let Some(name) = &self.responsible_name {
            shipment.responsible_name = name.trim().to_string();
        }
        if let Some(carrier) = self.carrier {
            shipment.carrier = carrier;
        }
        if let Some(pallets) = self.pallets {
            shipment.pallets = pallets;
        }
        if let Some(note) = &self.note {
            shipment.note = non_blank(note);
        }
        if let Some(manifest) = &self.manifest {
            shipment.manifest = non_blank(manifest);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShipmentFilter {
    pub state: Option<ShipmentState>,
    /// partial, case insensitive match on the driver name
    pub driver: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ShipmentFilter {
    fn matches(&self, shipment: &Shipment) -> bool {
        let created = shipment.created_at.to_datetime_utc();
        if self.from.is_some_and(|from| created < from) || self.to.is_some_and(|to| created > to) {
            return false;
        }
        if self.state.is_some_and(|state| state != shipment.state()) {
            return false;
        }
        match self.driver.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(term) => shipment
                .driver_name
                .to_lowercase()
                .contains(&term.to_lowercase()),
        }
    }
}

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
const JPEG_MAGIC: &[u8] = &[0xff, 0xd8, 0xff];

/// Checks that a signature payload is a base64 PNG or JPEG data url no larger than
/// `max_bytes` once decoded. Returns the sha256 digest of the image.
pub fn check_signature_image(data_url: &str, max_bytes: usize) -> Result<String> {
    let invalid = |message: &str| WorkflowError::field("signature", message);

    let (header, payload) = data_url
        .split_once(',')
        .ok_or_else(|| invalid("expected an image data url"))?;
    let magic = match header {
        "data:image/png;base64" => PNG_MAGIC,
        "data:image/jpeg;base64" | "data:image/jpg;base64" => JPEG_MAGIC,
        _ => return Err(invalid("only base64 png or jpeg images are accepted")),
    };

    // base64 grows payloads by 4/3
    if payload.len() / 4 * 3 > max_bytes {
        return Err(invalid("image is too large"));
    }

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|_| invalid("image is not valid base64"))?;
    if bytes.len() > max_bytes {
        return Err(invalid("image is too large"));
    }
    if !bytes.starts_with(magic) {
        return Err(invalid("payload is not an image"));
    }

    Ok(sha256::digest(&bytes))
}

pub struct ShipmentService {
    store: Arc<Store>,
    max_signature_bytes: usize,
}

impl ShipmentService {
    pub fn new(store: Arc<Store>, max_signature_bytes: usize) -> Self {
        Self {
            store,
            max_signature_bytes,
        }
    }

    /// Create an open shipment and bind every listed invoice, all or nothing.
    pub fn create(&self, actor: &Actor, draft: ShipmentDraft) -> Result<Shipment> {
        authorize(actor, Action::CreateShipment, Resource::None)?;
        let template = draft.validate_and_finalise(new_id(SHIPMENT_HRP)?, &actor.user_id)?;

        let tx_trees = (
            &self.store.shipments,
            &self.store.invoices,
            &self.store.invoice_keys,
        );
        let shipment = tx_trees.transaction(|(shipments, invoices, keys)| -> TxResult<Shipment> {
            let mut shipment = template.clone();
            for invoice_id in &draft.invoice_ids {
                bind_in_tx(invoices, keys, invoice_id, &mut shipment)?;
            }
            tx_save(shipments, &shipment.id, &shipment)?;
            Ok(shipment)
        })?;

        info!(
            shipment = %shipment.id,
            invoices = shipment.invoice_ids.len(),
            user = %actor.user_id,
            "shipment created"
        );
        Ok(shipment)
    }

    pub fn get(&self, actor: &Actor, shipment_id: &str) -> Result<Shipment> {
        authorize(actor, Action::Read, Resource::None)?;
        store::load(&self.store.shipments, shipment_id)?
            .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))
    }

    /// Newest first.
    pub fn list(&self, actor: &Actor, filter: &ShipmentFilter) -> Result<Vec<Shipment>> {
        authorize(actor, Action::Read, Resource::None)?;

        let mut shipments: Vec<Shipment> = store::load_all::<Shipment>(&self.store.shipments)?
            .into_iter()
            .filter(|shipment| filter.matches(shipment))
            .collect();
        shipments.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        debug!(count = shipments.len(), ?filter, "shipments listed");
        Ok(shipments)
    }

    /// Invoices currently bound to the shipment.
    pub fn invoices(&self, actor: &Actor, shipment_id: &str) -> Result<Vec<Invoice>> {
        let shipment = self.get(actor, shipment_id)?;
        shipment
            .invoice_ids
            .iter()
            .filter_map(|id| store::load::<Invoice>(&self.store.invoices, id).transpose())
            .collect()
    }

    /// Edit an open shipment. A finalized one can only be edited by an admin.
    pub fn update(&self, actor: &Actor, shipment_id: &str, changes: ShipmentUpdate) -> Result<Shipment> {
        let tx_trees = (
            &self.store.shipments,
            &self.store.invoices,
            &self.store.invoice_keys,
        );

        let shipment = tx_trees.transaction(|(shipments, invoices, keys)| -> TxResult<Shipment> {
            let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;
            authorize(actor, Action::UpdateShipment, Resource::Shipment(shipment.state()))?;

            changes.apply(&mut shipment)?;

            if let Some(wanted) = &changes.invoice_ids {
                let removed: Vec<String> = shipment
                    .invoice_ids
                    .iter()
                    .filter(|id| !wanted.contains(*id))
                    .cloned()
                    .collect();
                for invoice_id in &removed {
                    unbind_in_tx(invoices, keys, invoice_id, &mut shipment)?;
                }
                for invoice_id in wanted {
                    if !shipment.invoice_ids.contains(invoice_id) {
                        bind_in_tx(invoices, keys, invoice_id, &mut shipment)?;
                    }
                }
            }

            tx_save(shipments, shipment_id, &shipment)?;
            Ok(shipment)
        })?;

        info!(shipment = shipment_id, user = %actor.user_id, "shipment updated");
        Ok(shipment)
    }

    /// Bind several invoices in one transaction. Any failure leaves every invoice untouched.
    pub fn vincular_notas(
        &self,
        actor: &Actor,
        shipment_id: &str,
        invoice_ids: &[String],
    ) -> Result<Vec<Invoice>> {
        let tx_trees = (
            &self.store.shipments,
            &self.store.invoices,
            &self.store.invoice_keys,
        );

        let bound = tx_trees.transaction(|(shipments, invoices, keys)| -> TxResult<Vec<Invoice>> {
            let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;
            authorize(actor, Action::BindInvoice, Resource::Shipment(shipment.state()))?;
            if shipment.finalized {
                return Err(WorkflowError::InvalidState(format!(
                    "shipment {shipment_id} is finalized"
                ))
                .into());
            }

            let mut bound = Vec::with_capacity(invoice_ids.len());
            for invoice_id in invoice_ids {
                bound.push(bind_in_tx(invoices, keys, invoice_id, &mut shipment)?);
            }
            tx_save(shipments, shipment_id, &shipment)?;
            Ok(bound)
        })?;

        info!(shipment = shipment_id, count = bound.len(), "invoices bound in bulk");
        Ok(bound)
    }

    /// Record a signature image. Allowed whether or not the shipment is finalized.
    pub fn attach_signature(
        &self,
        actor: &Actor,
        shipment_id: &str,
        role: SignatureRole,
        data_url: &str,
    ) -> Result<Shipment> {
        authorize(actor, Action::AttachSignature, Resource::None)?;
        let digest = check_signature_image(data_url, self.max_signature_bytes)?;

        let shipment = self.store.shipments.transaction(|shipments| -> TxResult<Shipment> {
            let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;

            let signature = Some(Signature {
                image: data_url.to_string(),
                digest: digest.clone(),
                signed_at: TimeStamp::new(),
            });
            match role {
                SignatureRole::Driver => shipment.driver_signature = signature,
                SignatureRole::Responsible => shipment.responsible_signature = signature,
            }

            tx_save(shipments, shipment_id, &shipment)?;
            Ok(shipment)
        })?;

        info!(shipment = shipment_id, ?role, %digest, "signature attached");
        Ok(shipment)
    }

    /// OPEN -> FINALIZED. Finalizing twice is a conflict.
    pub fn finalize(&self, actor: &Actor, shipment_id: &str) -> Result<Shipment> {
        let shipment = self.store.shipments.transaction(|shipments| -> TxResult<Shipment> {
            let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;
            authorize(actor, Action::FinalizeShipment, Resource::Shipment(shipment.state()))?;

            if shipment.finalized {
                return Err(WorkflowError::Conflict(format!(
                    "shipment {shipment_id} is already finalized"
                ))
                .into());
            }

            shipment.finalized = true;
            shipment.finalized_at = Some(TimeStamp::new());
            tx_save(shipments, shipment_id, &shipment)?;
            Ok(shipment)
        })?;

        info!(shipment = shipment_id, user = %actor.user_id, "shipment finalized");
        Ok(shipment)
    }

    /// Delete a shipment after unbinding its invoices and detaching its orders, in one
    /// transaction.
    pub fn delete(&self, actor: &Actor, shipment_id: &str) -> Result<()> {
        let tx_trees = (
            &self.store.shipments,
            &self.store.invoices,
            &self.store.invoice_keys,
            &self.store.orders,
        );

        let released = tx_trees.transaction(|(shipments, invoices, keys, orders)| -> TxResult<usize> {
            let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;
            authorize(actor, Action::DeleteShipment, Resource::Shipment(shipment.state()))?;

            let members = shipment.invoice_ids.clone();
            for invoice_id in &members {
                if unbind_in_tx(invoices, keys, invoice_id, &mut shipment)?.is_none() {
                    warn!(shipment = shipment_id, invoice = %invoice_id, "dangling invoice membership");
                }
            }

            for order_id in &shipment.order_ids {
                let Some(mut order) = tx_load::<Order>(orders, order_id)? else {
                    continue;
                };
                if order.shipment_id.as_deref() == Some(shipment_id) {
                    order.shipment_id = None;
                    tx_save(orders, order_id, &order)?;
                }
            }

            shipments.remove(shipment_id)?;
            Ok(members.len())
        })?;

        info!(shipment = shipment_id, released, user = %actor.user_id, "shipment deleted");
        Ok(())
    }
}
