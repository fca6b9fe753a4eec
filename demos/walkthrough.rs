//! End to end run of a shipping day: invoices, a shipment, an order review and the
//! resulting leaderboard.
//!
//! Reads `romaneio.toml` from the working directory if present for scoring and logging
//! settings. The data itself goes to a throwaway database.

use std::path::Path;
use std::sync::Arc;

use romaneio::config::WorkflowConfig;
use romaneio::invoice::NewInvoice;
use romaneio::order::CheckReport;
use romaneio::shipment::{Carrier, ShipmentDraft};
use romaneio::store::Store;
use romaneio::telemetry::init_tracing;
use romaneio::{Outcome, Role, Workflow};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = WorkflowConfig::load(Some(Path::new("romaneio.toml")))?;
    init_tracing(&config.logging);

    let temp_dir = tempfile::tempdir()?;
    let db = sled::open(temp_dir.path().join("walkthrough.db"))?;
    let wf = Workflow::new(Arc::new(Store::new(Arc::new(db))?), &config);

    // people
    wf.users.bootstrap_admin("admin", "Ana Admin")?;
    let admin = wf.users.actor_for("admin")?;
    for (id, name, role) in [
        ("gerente", "Gil Gerente", Role::Gerente),
        ("separador", "Sara Separadora", Role::Separador),
        ("conferente", "Caio Conferente", Role::Conferente),
        ("auditor", "Alice Auditora", Role::Auditor),
    ] {
        wf.users.register(&admin, id, name, role)?;
    }
    let manager = wf.users.actor_for("gerente")?;
    let separator = wf.users.actor_for("separador")?;
    let conferente = wf.users.actor_for("conferente")?;
    let auditor = wf.users.actor_for("auditor")?;

    // invoices and the shipment carrying them
    let first = wf
        .invoices
        .create(&manager, NewInvoice::new("35240101", "1001", "1.250,90", 3))?;
    let second = wf
        .invoices
        .create(&manager, NewInvoice::new("35240102", "1002", "89,90", 1))?;

    let shipment = wf.shipments.create(
        &manager,
        ShipmentDraft::new()
            .set_driver_name("Joao da Silva")
            .set_driver_tax_id("529.982.247-25")
            .set_responsible_name("Gil Gerente")
            .set_carrier(Carrier::Braspress)
            .set_pallets(2)
            .add_invoice(&first.id)
            .add_invoice(&second.id),
    )?;
    let shipment = wf.shipments.finalize(&manager, &shipment.id)?;
    info!(shipment = %shipment.id, invoices = shipment.invoice_ids.len(), "shipment ready");

    // order review
    let order = wf
        .orders
        .create_order(&manager, "PED-0001", Some(&shipment.id))?;
    wf.orders
        .record_separation(&separator, &order.id, &separator.user_id)?;
    wf.orders
        .submit_conference(&conferente, &order.id, CheckReport::clean())?;
    wf.orders
        .submit_audit(&auditor, &order.id, CheckReport::clean())?;
    let (_, events) = wf.orders.validate(&manager, &order.id, Outcome::Correct)?;
    info!(events = events.len(), "review validated");

    for score in wf.scoring.leaderboard(&manager)? {
        println!(
            "#{} {:<12} {:>4} pts ({} correct, {} incorrect)",
            score.rank, score.user_id, score.total, score.correct, score.incorrect
        );
    }

    wf.flush()?;
    Ok(())
}
