//! Role based authorization.
//!
//! One table answers "may this role perform this action on a resource in this state".
//! Services call [`authorize`] before touching the store.
use crate::error::WorkflowError;
use crate::types::{Actor, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipmentState {
    Open,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateInvoice,
    DeleteInvoice,
    BindInvoice,
    CreateShipment,
    UpdateShipment,
    AttachSignature,
    FinalizeShipment,
    DeleteShipment,
    CreateOrder,
    RecordSeparation,
    SubmitConference,
    SubmitAudit,
    ValidateReview,
    RecordScore,
    ManageUsers,
    SetUserActive,
    Read,
}

/// The part of a resource's state that decisions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    None,
    Shipment(ShipmentState),
    Invoice {
        bound: bool,
        shipment: Option<ShipmentState>,
    },
    User {
        target_role: Role,
        is_self: bool,
    },
}

pub fn can(role: Role, action: Action, resource: Resource) -> bool {
    use Role::*;

    if role == Anonymous {
        return false;
    }

    match action {
        Action::Read
        | Action::CreateInvoice
        | Action::BindInvoice
        | Action::CreateShipment
        | Action::AttachSignature
        | Action::CreateOrder => true,
        Action::UpdateShipment => match resource {
            Resource::Shipment(ShipmentState::Finalized) => role == Admin,
            _ => true,
        },
        Action::FinalizeShipment => role.is_privileged(),
        Action::DeleteShipment => match resource {
            Resource::Shipment(ShipmentState::Finalized) => role == Admin,
            _ => role.is_privileged(),
        },
        Action::DeleteInvoice => match resource {
            Resource::Invoice { bound: false, .. } => true,
            Resource::Invoice {
                shipment: Some(ShipmentState::Finalized),
                ..
            } => false,
            _ => role.is_privileged(),
        },
        Action::RecordSeparation => matches!(role, Admin | Gerente | Separador),
        Action::SubmitConference => matches!(role, Admin | Gerente | Conferente),
        Action::SubmitAudit => matches!(role, Admin | Auditor),
        Action::ValidateReview | Action::RecordScore => role.is_privileged(),
        Action::ManageUsers => match resource {
            Resource::User { target_role, .. } => {
                role == Admin || (role == Gerente && target_role != Admin)
            }
            _ => role == Admin,
        },
        Action::SetUserActive => match resource {
            Resource::User { target_role, is_self } => {
                role == Admin || (role == Gerente && target_role != Admin && !is_self)
            }
            _ => false,
        },
    }
}

/// Like [`can`] but produces the error a caller should surface.
pub fn authorize(actor: &Actor, action: Action, resource: Resource) -> Result<(), WorkflowError> {
    if actor.role == Role::Anonymous {
        tracing::warn!(?action, "anonymous caller rejected");
        return Err(WorkflowError::Unauthorized);
    }
    if !can(actor.role, action, resource) {
        tracing::warn!(user = %actor.user_id, role = ?actor.role, ?action, ?resource, "action denied");
        return Err(WorkflowError::Forbidden);
    }
    Ok(())
}
