//! Orders (pedidos) and their review pipeline:
//! separation -> conference -> audit -> manager validation.
//!
//! The review record is keyed by its order id, so an order has at most one review and
//! the review is addressed by that same id.
use std::sync::Arc;

use chrono::Utc;
use sled::Transactional;
use tracing::{debug, info, warn};

use crate::error::{FieldError, Result, WorkflowError};
use crate::policy::{Action, Resource, authorize};
use crate::scoring::{ScoringEvent, ScoringPolicy, record_in_tx};
use crate::shipment::Shipment;
use crate::store::{self, Store, TxResult, tx_load, tx_save};
use crate::types::{Actor, Outcome, TimeStamp};
use crate::utils::{ORDER_HRP, new_id};
use crate::validators::{ensure_valid, validate_required};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Order {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub number: String,
    #[n(2)]
    pub shipment_id: Option<String>,
    #[n(3)]
    pub created_at: TimeStamp<Utc>,
    #[n(4)]
    pub separator_id: Option<String>,
    #[n(5)]
    pub separated_at: Option<TimeStamp<Utc>>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Correct,
    #[n(2)]
    Incorrect,
}

impl From<Outcome> for ValidationStatus {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Correct => ValidationStatus::Correct,
            Outcome::Incorrect => ValidationStatus::Incorrect,
        }
    }
}

/// Position of an order in the review pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStage {
    Unreviewed,
    Conferred,
    Audited,
    Validated(Outcome),
}

/// What a conferer or auditor reports after checking an order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub fully_picked: bool,
    pub inconsistency: bool,
    pub reason_codes: Vec<String>,
    pub notes: Option<String>,
}

impl CheckReport {
    pub fn clean() -> Self {
        Self {
            fully_picked: true,
            ..Self::default()
        }
    }

    pub fn with_inconsistency(reason_codes: &[&str], notes: &str) -> Self {
        Self {
            fully_picked: false,
            inconsistency: true,
            reason_codes: reason_codes.iter().map(|c| c.to_string()).collect(),
            notes: Some(notes.to_string()),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut errors = vec![];
        if self.inconsistency && self.reason_codes.is_empty() {
            errors.push(FieldError::new(
                "reason_codes",
                "at least one reason is required when reporting an inconsistency",
            ));
        }
        if self.reason_codes.iter().any(|code| code.trim().is_empty()) {
            errors.push(FieldError::new("reason_codes", "reason codes cannot be blank"));
        }
        ensure_valid(errors)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OrderReview {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    pub separator_id: Option<String>,
    #[n(2)]
    pub conferente_id: Option<String>,
    #[n(3)]
    pub auditor_id: Option<String>,
    #[n(4)]
    pub validator_id: Option<String>,
    #[n(5)]
    pub fully_picked: bool,
    #[n(6)]
    pub inconsistency: bool,
    #[n(7)]
    pub reason_codes: Vec<String>,
    #[n(8)]
    pub notes: Option<String>,
    #[n(9)]
    pub conference_performed: bool,
    #[n(10)]
    pub conferred_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub audit_performed: bool,
    #[n(12)]
    pub audited_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    pub audit_has_error: bool,
    #[n(14)]
    pub audit_fully_picked: bool,
    #[n(15)]
    pub audit_reason_codes: Vec<String>,
    #[n(16)]
    pub audit_notes: Option<String>,
    #[n(17)]
    pub validation_status: ValidationStatus,
    #[n(18)]
    pub validated_at: Option<TimeStamp<Utc>>,
}

impl OrderReview {
    fn conferred(order: &Order, conferente_id: &str, report: &CheckReport) -> Self {
        Self {
            order_id: order.id.clone(),
            separator_id: order.separator_id.clone(),
            conferente_id: Some(conferente_id.to_string()),
            auditor_id: None,
            validator_id: None,
            fully_picked: report.fully_picked,
            inconsistency: report.inconsistency,
            reason_codes: report.reason_codes.clone(),
            notes: report.notes.clone(),
            conference_performed: true,
            conferred_at: Some(TimeStamp::new()),
            audit_performed: false,
            audited_at: None,
            audit_has_error: false,
            audit_fully_picked: false,
            audit_reason_codes: vec![],
            audit_notes: None,
            validation_status: ValidationStatus::Pending,
            validated_at: None,
        }
    }

    pub fn stage(&self) -> ReviewStage {
        match self.validation_status {
            ValidationStatus::Correct => ReviewStage::Validated(Outcome::Correct),
            ValidationStatus::Incorrect => ReviewStage::Validated(Outcome::Incorrect),
            ValidationStatus::Pending if self.audit_performed => ReviewStage::Audited,
            ValidationStatus::Pending if self.conference_performed => ReviewStage::Conferred,
            ValidationStatus::Pending => ReviewStage::Unreviewed,
        }
    }

    /// Users credited or penalised when this review is validated.
    pub fn participants(&self) -> Vec<(&'static str, &str)> {
        [
            ("separator", self.separator_id.as_deref()),
            ("conferente", self.conferente_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(role, user)| user.map(|user| (role, user)))
        .collect()
    }
}

pub struct OrderWorkflow {
    store: Arc<Store>,
    scoring: ScoringPolicy,
}

impl OrderWorkflow {
    pub fn new(store: Arc<Store>, scoring: ScoringPolicy) -> Self {
        Self { store, scoring }
    }

    pub fn create_order(
        &self,
        actor: &Actor,
        number: &str,
        shipment_id: Option<&str>,
    ) -> Result<Order> {
        authorize(actor, Action::CreateOrder, Resource::None)?;
        ensure_valid(validate_required(&[("number", Some(number))]))?;

        let order = Order {
            id: new_id(ORDER_HRP)?,
            number: number.trim().to_string(),
            shipment_id: shipment_id.map(str::to_string),
            created_at: TimeStamp::new(),
            separator_id: None,
            separated_at: None,
        };

        let tx_trees = (
            &self.store.orders,
            &self.store.order_numbers,
            &self.store.shipments,
        );
        tx_trees.transaction(|(orders, numbers, shipments)| -> TxResult<()> {
            if let Some(shipment_id) = order.shipment_id.as_deref() {
                let mut shipment: Shipment = tx_load(shipments, shipment_id)?
                    .ok_or_else(|| WorkflowError::not_found("shipment", shipment_id))?;
                shipment.order_ids.push(order.id.clone());
                tx_save(shipments, shipment_id, &shipment)?;
            }
            if numbers.get(order.number.as_str())?.is_some() {
                return Err(WorkflowError::Conflict(format!(
                    "order number {} already exists",
                    order.number
                ))
                .into());
            }

            numbers.insert(order.number.as_str(), order.id.as_str())?;
            tx_save(orders, &order.id, &order)?;
            Ok(())
        })?;

        info!(order = %order.id, number = %order.number, "order created");
        Ok(order)
    }

    pub fn get_order(&self, actor: &Actor, order_id: &str) -> Result<Order> {
        authorize(actor, Action::Read, Resource::None)?;
        store::load(&self.store.orders, order_id)?
            .ok_or_else(|| WorkflowError::not_found("order", order_id))
    }

    /// Orders, optionally limited to one shipment, newest first.
    pub fn list_orders(&self, actor: &Actor, shipment_id: Option<&str>) -> Result<Vec<Order>> {
        authorize(actor, Action::Read, Resource::None)?;

        let mut orders: Vec<Order> = store::load_all::<Order>(&self.store.orders)?
            .into_iter()
            .filter(|order| shipment_id.is_none() || order.shipment_id.as_deref() == shipment_id)
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        debug!(count = orders.len(), "orders listed");
        Ok(orders)
    }

    pub fn get_review(&self, actor: &Actor, order_id: &str) -> Result<Option<OrderReview>> {
        authorize(actor, Action::Read, Resource::None)?;
        store::load(&self.store.reviews, order_id)
    }

    pub fn stage(&self, actor: &Actor, order_id: &str) -> Result<ReviewStage> {
        self.get_order(actor, order_id)?;
        Ok(self
            .get_review(actor, order_id)?
            .map_or(ReviewStage::Unreviewed, |review| review.stage()))
    }

    /// Assign the picker of an order. Repeating the same separator is a no-op.
    pub fn record_separation(
        &self,
        actor: &Actor,
        order_id: &str,
        separator_id: &str,
    ) -> Result<Order> {
        authorize(actor, Action::RecordSeparation, Resource::None)?;
        ensure_valid(validate_required(&[("separator_id", Some(separator_id))]))?;

        let order = (&self.store.orders, &self.store.reviews).transaction(
            |(orders, reviews)| -> TxResult<Order> {
                let mut order: Order = tx_load(orders, order_id)?
                    .ok_or_else(|| WorkflowError::not_found("order", order_id))?;

                match order.separator_id.as_deref() {
                    Some(current) if current == separator_id => return Ok(order),
                    Some(current) => {
                        return Err(WorkflowError::Conflict(format!(
                            "order {} was already separated by {current}",
                            order.number
                        ))
                        .into());
                    }
                    None => {}
                }

                order.separator_id = Some(separator_id.to_string());
                order.separated_at = Some(TimeStamp::new());
                tx_save(orders, order_id, &order)?;

                if let Some(mut review) = tx_load::<OrderReview>(reviews, order_id)? {
                    if review.separator_id.is_none() {
                        review.separator_id = Some(separator_id.to_string());
                        tx_save(reviews, order_id, &review)?;
                    }
                }
                Ok(order)
            },
        )?;

        info!(order = order_id, separator = separator_id, "separation recorded");
        Ok(order)
    }

    /// First check of a picked order. Conference happens once per order.
    pub fn submit_conference(
        &self,
        actor: &Actor,
        order_id: &str,
        report: CheckReport,
    ) -> Result<OrderReview> {
        authorize(actor, Action::SubmitConference, Resource::None)?;
        report.validate()?;

        let review = (&self.store.orders, &self.store.reviews).transaction(
            |(orders, reviews)| -> TxResult<OrderReview> {
                let order: Order = tx_load(orders, order_id)?
                    .ok_or_else(|| WorkflowError::not_found("order", order_id))?;

                if reviews.get(order_id)?.is_some() {
                    return Err(WorkflowError::Conflict(format!(
                        "order {} was already conferred",
                        order.number
                    ))
                    .into());
                }

                let review = OrderReview::conferred(&order, &actor.user_id, &report);
                tx_save(reviews, order_id, &review)?;
                Ok(review)
            },
        )?;

        info!(
            order = order_id,
            conferente = %actor.user_id,
            inconsistency = review.inconsistency,
            "conference recorded"
        );
        Ok(review)
    }

    /// Second check by an auditor. Needs a conferred, separated order not yet audited.
    pub fn submit_audit(
        &self,
        actor: &Actor,
        order_id: &str,
        report: CheckReport,
    ) -> Result<OrderReview> {
        authorize(actor, Action::SubmitAudit, Resource::None)?;
        report.validate()?;

        let review = (&self.store.orders, &self.store.reviews).transaction(
            |(orders, reviews)| -> TxResult<OrderReview> {
                if tx_load::<Order>(orders, order_id)?.is_none() {
                    return Err(WorkflowError::not_found("order", order_id).into());
                }

                let Some(mut review) = tx_load::<OrderReview>(reviews, order_id)? else {
                    return Err(WorkflowError::InvalidState(
                        "order has not been conferred yet".into(),
                    )
                    .into());
                };
                if review.separator_id.is_none() {
                    return Err(WorkflowError::InvalidState(
                        "order has no separator assigned".into(),
                    )
                    .into());
                }
                if review.audit_performed {
                    return Err(WorkflowError::InvalidState(
                        "order was already audited".into(),
                    )
                    .into());
                }

                review.auditor_id = Some(actor.user_id.clone());
                review.audit_performed = true;
                review.audited_at = Some(TimeStamp::new());
                review.audit_has_error = report.inconsistency;
                review.audit_fully_picked = report.fully_picked;
                review.audit_reason_codes = report.reason_codes.clone();
                review.audit_notes = report.notes.clone();

                tx_save(reviews, order_id, &review)?;
                Ok(review)
            },
        )?;

        if review.audit_has_error {
            warn!(order = order_id, auditor = %actor.user_id, "audit found an error");
        } else {
            info!(order = order_id, auditor = %actor.user_id, "audit recorded");
        }
        Ok(review)
    }

    /// Manager verdict on an audited review. Scores every participant in the same
    /// transaction that stores the verdict.
    pub fn validate(
        &self,
        actor: &Actor,
        order_id: &str,
        outcome: Outcome,
    ) -> Result<(OrderReview, Vec<ScoringEvent>)> {
        authorize(actor, Action::ValidateReview, Resource::None)?;

        let points = self.scoring.points_for(outcome);
        let verdict = match outcome {
            Outcome::Correct => "correct",
            Outcome::Incorrect => "incorrect",
        };

        let tx_trees = (
            &self.store.orders,
            &self.store.reviews,
            &self.store.score_events,
            &self.store.leaderboard,
        );
        let (review, events) = tx_trees.transaction(
            |(orders, reviews, events, leaderboard)| -> TxResult<(OrderReview, Vec<ScoringEvent>)> {
                if tx_load::<Order>(orders, order_id)?.is_none() {
                    return Err(WorkflowError::not_found("order", order_id).into());
                }

                let Some(mut review) = tx_load::<OrderReview>(reviews, order_id)? else {
                    return Err(WorkflowError::InvalidState(
                        "order has not been conferred yet".into(),
                    )
                    .into());
                };

                if review.validation_status != ValidationStatus::Pending {
                    return Err(WorkflowError::InvalidState(
                        "review was already validated".into(),
                    )
                    .into());
                }
                if !review.audit_performed {
                    return Err(WorkflowError::InvalidState(
                        "review has not been audited yet".into(),
                    )
                    .into());
                }

                review.validation_status = outcome.into();
                review.validator_id = Some(actor.user_id.clone());
                review.validated_at = Some(TimeStamp::new());
                tx_save(reviews, order_id, &review)?;

                let mut recorded = vec![];
                for (role, user_id) in review.participants() {
                    let description = format!("order {order_id} validated {verdict} ({role})");
                    let event = ScoringEvent::new(user_id, order_id, outcome, points, &description)?;
                    record_in_tx(events, leaderboard, &event)?;
                    recorded.push(event);
                }

                Ok((review, recorded))
            },
        )?;

        info!(
            order = order_id,
            validator = %actor.user_id,
            verdict,
            scored = events.len(),
            "review validated"
        );
        Ok((review, events))
    }
}
