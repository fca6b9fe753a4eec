use std::sync::Arc;

use anyhow::Context;
use romaneio::config::WorkflowConfig;
use romaneio::invoice::{BindingFilter, InvoiceFilter, NewInvoice};
use romaneio::order::{CheckReport, ReviewStage};
use romaneio::shipment::{Carrier, ShipmentDraft, ShipmentUpdate};
use romaneio::store::Store;
use romaneio::{Actor, ErrorKind, Outcome, Role, Workflow};

use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

// Sled locks its files, so every test gets its own database under a temp dir.
fn open_workflow(name: &str) -> anyhow::Result<(TempDir, Workflow)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(name))?;
    let store = Store::new(Arc::new(db))?;
    Ok((temp_dir, Workflow::new(Arc::new(store), &WorkflowConfig::default())))
}

fn draft(driver: &str) -> ShipmentDraft {
    ShipmentDraft::new()
        .set_driver_name(driver)
        .set_driver_tax_id("529.982.247-25")
        .set_responsible_name("Marta")
        .set_carrier(Carrier::Jadlog)
        .set_pallets(3)
}

#[test]
fn finalized_shipment_cannot_be_deleted_by_manager() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("scenario_a.db")?;
    let manager = Actor::new("gerente1", Role::Gerente);

    let shipment = wf
        .shipments
        .create(&manager, draft("Joao"))
        .context("Shipment failed on create: ")?;
    assert_eq!(shipment.driver_tax_id, "52998224725");
    assert!(shipment.invoice_ids.is_empty());

    let shipment = wf.shipments.finalize(&manager, &shipment.id)?;
    assert!(shipment.finalized);
    assert!(shipment.finalized_at.is_some());

    let err = wf.shipments.delete(&manager, &shipment.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    // still there
    assert!(wf.shipments.get(&manager, &shipment.id)?.finalized);

    Ok(())
}

#[test]
fn invoice_must_be_unbound_before_rebinding() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("scenario_b.db")?;
    let user = Actor::new("user1", Role::Usuario);

    let invoice = wf
        .invoices
        .create(&user, NewInvoice::new("X1", "100", "50,00", 2))?;
    assert_eq!(invoice.value_cents, 5_000);

    let s = wf.shipments.create(&user, draft("Joao"))?;
    let t = wf.shipments.create(&user, draft("Pedro"))?;

    let bound = wf.invoices.bind(&user, &invoice.id, &s.id)?;
    assert_eq!(bound.shipment_id.as_deref(), Some(s.id.as_str()));

    let err = wf.invoices.bind(&user, &invoice.id, &t.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(wf.shipments.get(&user, &t.id)?.invoice_ids.is_empty());

    wf.invoices.unbind(&user, &invoice.id)?;
    assert!(wf.shipments.get(&user, &s.id)?.invoice_ids.is_empty());

    let rebound = wf.invoices.bind(&user, &invoice.id, &t.id)?;
    assert_eq!(rebound.shipment_id.as_deref(), Some(t.id.as_str()));
    assert_eq!(wf.shipments.get(&user, &t.id)?.invoice_ids, vec![invoice.id]);

    Ok(())
}

#[test]
fn order_review_pipeline_scores_participants() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("scenario_c.db")?;
    let manager = Actor::new("manager1", Role::Gerente);
    let separator = Actor::new("separador1", Role::Separador);
    let conferente = Actor::new("conferente1", Role::Conferente);
    let auditor = Actor::new("auditor1", Role::Auditor);

    let order = wf.orders.create_order(&manager, "PED-1", None)?;

    let err = wf
        .orders
        .submit_audit(&auditor, &order.id, CheckReport::clean())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(wf.orders.get_review(&manager, &order.id)?.is_none());

    wf.orders
        .record_separation(&separator, &order.id, &separator.user_id)?;

    let review = wf
        .orders
        .submit_conference(&conferente, &order.id, CheckReport::clean())?;
    assert_eq!(review.stage(), ReviewStage::Conferred);
    assert_eq!(review.separator_id.as_deref(), Some("separador1"));

    let review = wf
        .orders
        .submit_audit(&auditor, &order.id, CheckReport::clean())?;
    assert_eq!(review.stage(), ReviewStage::Audited);
    assert!(!review.audit_has_error);

    let (review, events) = wf.orders.validate(&manager, &order.id, Outcome::Correct)?;
    assert_eq!(review.stage(), ReviewStage::Validated(Outcome::Correct));
    assert_eq!(review.validator_id.as_deref(), Some("manager1"));

    let mut scored: Vec<_> = events
        .iter()
        .map(|e| (e.user_id.as_str(), e.points))
        .collect();
    scored.sort();
    assert_eq!(scored, vec![("conferente1", 10), ("separador1", 10)]);

    for user in ["separador1", "conferente1"] {
        let history = wf.scoring.events_for(&manager, user)?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, Outcome::Correct);
    }

    let board = wf.scoring.leaderboard(&manager)?;
    let ranks: Vec<_> = board.iter().map(|s| s.rank).collect();
    assert_eq!(ranks, vec![1, 2]);

    // terminal
    let err = wf
        .orders
        .validate(&manager, &order.id, Outcome::Incorrect)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(wf.scoring.events_for(&manager, "separador1")?.len(), 1);

    Ok(())
}

#[test]
fn incorrect_validation_penalises_every_participant() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("penalty.db")?;
    let admin = Actor::new("admin", Role::Admin);
    let conferente = Actor::new("conferente1", Role::Conferente);

    let order = wf.orders.create_order(&admin, "PED-2", None)?;
    let review = wf.orders.submit_conference(
        &conferente,
        &order.id,
        CheckReport::with_inconsistency(&["wrong_item"], "sent the blue one"),
    )?;
    assert!(review.inconsistency);

    // audit needs a separator
    let err = wf
        .orders
        .submit_audit(&admin, &order.id, CheckReport::clean())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(
        wf.orders.get_review(&admin, &order.id)?,
        Some(review),
        "failed audit must not touch the review"
    );

    // separation recorded after conference reaches the review
    wf.orders.record_separation(&admin, &order.id, "separador9")?;
    let review = wf.orders.submit_audit(
        &admin,
        &order.id,
        CheckReport::with_inconsistency(&["wrong_item"], "confirmed"),
    )?;
    assert!(review.audit_has_error);
    assert_eq!(review.separator_id.as_deref(), Some("separador9"));

    let (_, events) = wf.orders.validate(&admin, &order.id, Outcome::Incorrect)?;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.points == -5));

    let score = wf
        .scoring
        .score_for(&admin, "conferente1")?
        .context("conferente has no score")?;
    assert_eq!((score.total, score.correct, score.incorrect), (-5, 0, 1));

    Ok(())
}

#[test]
fn conference_is_one_shot() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("conference.db")?;
    let first = Actor::new("conferente1", Role::Conferente);
    let second = Actor::new("conferente2", Role::Conferente);

    let order = wf.orders.create_order(&first, "PED-3", None)?;
    let review = wf
        .orders
        .submit_conference(&first, &order.id, CheckReport::clean())?;

    let err = wf
        .orders
        .submit_conference(
            &second,
            &order.id,
            CheckReport::with_inconsistency(&["missing_item"], "late"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let stored = wf
        .orders
        .get_review(&first, &order.id)?
        .context("review missing")?;
    assert_eq!(stored, review);
    assert_eq!(stored.conferente_id.as_deref(), Some("conferente1"));

    let err = wf
        .orders
        .submit_conference(&first, "pd_missing", CheckReport::clean())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    Ok(())
}

#[test]
fn deleting_shipment_releases_invoices() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("cascade.db")?;
    let admin = Actor::new("admin", Role::Admin);

    let a = wf.invoices.create(&admin, NewInvoice::new("K1", "1", "10,00", 1))?;
    let b = wf.invoices.create(&admin, NewInvoice::new("K2", "2", "20,00", 1))?;

    let shipment = wf
        .shipments
        .create(&admin, draft("Joao").add_invoice(&a.id).add_invoice(&b.id))?;
    assert_eq!(shipment.invoice_ids.len(), 2);

    wf.shipments.finalize(&admin, &shipment.id)?;
    let err = wf.invoices.delete(&admin, &a.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    // admin may delete a finalized shipment
    wf.shipments.delete(&admin, &shipment.id)?;
    assert_eq!(
        wf.shipments.get(&admin, &shipment.id).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let unbound = wf.invoices.list(
        &admin,
        &InvoiceFilter {
            binding: BindingFilter::Unbound,
            ..InvoiceFilter::default()
        },
    )?;
    assert_eq!(unbound.len(), 2);

    // released invoices are back in the working set
    let err = wf
        .invoices
        .create(&admin, NewInvoice::new("K1", "99", "1,00", 1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    Ok(())
}

#[test]
fn working_set_remembers_every_unbound_duplicate() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("working_set.db")?;
    let manager = Actor::new("gerente1", Role::Gerente);

    let first = wf.invoices.create(&manager, NewInvoice::new("X", "1", "1,00", 1))?;
    let shipment = wf.shipments.create(&manager, draft("Joao"))?;
    wf.invoices.bind(&manager, &first.id, &shipment.id)?;

    // code X is free again while the first invoice is bound
    let second = wf.invoices.create(&manager, NewInvoice::new("X", "2", "1,00", 1))?;

    // both are now unbound with the same code
    wf.invoices.unbind(&manager, &first.id)?;
    wf.invoices.delete(&manager, &second.id)?;

    let err = wf
        .invoices
        .create(&manager, NewInvoice::new("X", "3", "1,00", 1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // once the last holder is gone the code can be reused
    wf.invoices.delete(&manager, &first.id)?;
    wf.invoices.create(&manager, NewInvoice::new("X", "3", "1,00", 1))?;

    Ok(())
}

#[test]
fn deleting_shipment_detaches_its_orders() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("detach_orders.db")?;
    let manager = Actor::new("gerente1", Role::Gerente);

    let shipment = wf.shipments.create(&manager, draft("Joao"))?;
    let order = wf
        .orders
        .create_order(&manager, "PED-9", Some(&shipment.id))?;
    assert_eq!(wf.orders.list_orders(&manager, Some(&shipment.id))?.len(), 1);
    assert_eq!(wf.shipments.get(&manager, &shipment.id)?.order_ids, vec![order.id.clone()]);

    wf.shipments.delete(&manager, &shipment.id)?;

    assert!(wf.orders.list_orders(&manager, Some(&shipment.id))?.is_empty());
    assert_eq!(wf.orders.get_order(&manager, &order.id)?.shipment_id, None);

    Ok(())
}

#[test]
fn validating_unconferred_order_is_invalid_state() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("early_validate.db")?;
    let manager = Actor::new("gerente1", Role::Gerente);

    let order = wf.orders.create_order(&manager, "PED-4", None)?;
    let err = wf
        .orders
        .validate(&manager, &order.id, Outcome::Correct)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(wf.orders.get_review(&manager, &order.id)?.is_none());
    assert!(wf.scoring.leaderboard(&manager)?.is_empty());

    let err = wf
        .orders
        .validate(&manager, "pd_missing", Outcome::Correct)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    Ok(())
}

#[test]
fn shipment_creation_is_all_or_nothing() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("atomic_create.db")?;
    let user = Actor::new("user1", Role::Usuario);

    let invoice = wf.invoices.create(&user, NewInvoice::new("K1", "1", "10,00", 1))?;
    let err = wf
        .shipments
        .create(&user, draft("Joao").add_invoice(&invoice.id).add_invoice("nf_missing"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(!wf.invoices.get(&user, &invoice.id)?.is_bound());
    assert!(wf.shipments.list(&user, &Default::default())?.is_empty());

    Ok(())
}

#[test]
fn finalized_shipment_is_frozen_except_for_admin() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("frozen.db")?;
    let admin = Actor::new("admin", Role::Admin);
    let manager = Actor::new("gerente1", Role::Gerente);

    let invoice = wf.invoices.create(&manager, NewInvoice::new("K1", "1", "10,00", 1))?;
    let shipment = wf.shipments.create(&manager, draft("Joao"))?;
    let created_at = shipment.created_at.clone();
    let finalized = wf.shipments.finalize(&manager, &shipment.id)?;

    let err = wf.shipments.finalize(&admin, &shipment.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(
        wf.shipments.get(&admin, &shipment.id)?,
        finalized,
        "rejected finalize must leave the record alone"
    );

    let err = wf.invoices.bind(&admin, &invoice.id, &shipment.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let rename = ShipmentUpdate {
        driver_name: Some("Joao Silva".into()),
        ..ShipmentUpdate::default()
    };
    let err = wf
        .shipments
        .update(&manager, &shipment.id, rename.clone())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let updated = wf.shipments.update(
        &admin,
        &shipment.id,
        ShipmentUpdate {
            invoice_ids: Some(vec![invoice.id.clone()]),
            ..rename
        },
    )?;
    assert_eq!(updated.driver_name, "Joao Silva");
    assert_eq!(updated.invoice_ids, vec![invoice.id.clone()]);
    assert_eq!(updated.created_at, created_at);
    assert!(updated.finalized);

    let bad_tax_id = ShipmentUpdate {
        driver_tax_id: Some("111.111.111-11".into()),
        ..ShipmentUpdate::default()
    };
    let err = wf.shipments.update(&admin, &shipment.id, bad_tax_id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    Ok(())
}

#[test]
fn concurrent_finalize_succeeds_once() -> anyhow::Result<()> {
    let (_dir, wf) = open_workflow("race.db")?;
    let wf = Arc::new(wf);
    let manager = Actor::new("gerente1", Role::Gerente);
    let shipment = wf.shipments.create(&manager, draft("Joao"))?;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let wf = wf.clone();
            let manager = manager.clone();
            let id = shipment.id.clone();
            std::thread::spawn(move || wf.shipments.finalize(&manager, &id).is_ok())
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().expect("finalize thread panicked"))
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);

    Ok(())
}
