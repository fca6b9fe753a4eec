//! Directory of back office users and their active flag.
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{Result, WorkflowError};
use crate::policy::{Action, Resource, authorize};
use crate::store::{self, Store, TxResult, tx_load, tx_save};
use crate::types::{Actor, Role, TimeStamp};
use crate::validators::{ensure_valid, validate_required};

// marks a directory that already went through bootstrap
const BOOTSTRAP_MARKER: &str = "\0bootstrapped";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub role: Role,
    #[n(3)]
    pub active: bool,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
}

pub struct UserDirectory {
    store: Arc<Store>,
}

impl UserDirectory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Add the very first administrator. Only works on an empty directory.
    pub fn bootstrap_admin(&self, id: &str, name: &str) -> Result<UserRecord> {
        ensure_valid(validate_required(&[("id", Some(id)), ("name", Some(name))]))?;
        let record = UserRecord {
            id: id.trim().to_string(),
            name: name.trim().to_string(),
            role: Role::Admin,
            active: true,
            created_at: TimeStamp::new(),
        };

        self.store.users.transaction(|users| -> TxResult<()> {
            // a transactional tree cannot be iterated, so emptiness is checked on a marker
            if users.get(BOOTSTRAP_MARKER)?.is_some() {
                return Err(WorkflowError::Conflict("directory already has an administrator".into()).into());
            }
            users.insert(BOOTSTRAP_MARKER, record.id.as_str())?;
            tx_save(users, &record.id, &record)?;
            Ok(())
        })?;

        info!(user = %record.id, "administrator bootstrapped");
        Ok(record)
    }

    pub fn register(&self, actor: &Actor, id: &str, name: &str, role: Role) -> Result<UserRecord> {
        authorize(
            actor,
            Action::ManageUsers,
            Resource::User {
                target_role: role,
                is_self: false,
            },
        )?;
        ensure_valid(validate_required(&[("id", Some(id)), ("name", Some(name))]))?;
        if role == Role::Anonymous {
            return Err(WorkflowError::field("role", "cannot register a signed out role"));
        }

        let record = UserRecord {
            id: id.trim().to_string(),
            name: name.trim().to_string(),
            role,
            active: true,
            created_at: TimeStamp::new(),
        };

        self.store.users.transaction(|users| -> TxResult<()> {
            if users.get(record.id.as_str())?.is_some() {
                return Err(WorkflowError::Conflict(format!("user {} already exists", record.id)).into());
            }
            tx_save(users, &record.id, &record)?;
            Ok(())
        })?;

        info!(user = %record.id, role = ?record.role, by = %actor.user_id, "user registered");
        Ok(record)
    }

    pub fn get(&self, actor: &Actor, user_id: &str) -> Result<UserRecord> {
        authorize(actor, Action::Read, Resource::None)?;
        store::load(&self.store.users, user_id)?
            .ok_or_else(|| WorkflowError::not_found("user", user_id))
    }

    /// Activate or deactivate an account.
    pub fn set_active(&self, actor: &Actor, user_id: &str, active: bool) -> Result<UserRecord> {
        let record = self.store.users.transaction(|users| -> TxResult<UserRecord> {
            let mut record: UserRecord = tx_load(users, user_id)?
                .ok_or_else(|| WorkflowError::not_found("user", user_id))?;
            authorize(
                actor,
                Action::SetUserActive,
                Resource::User {
                    target_role: record.role,
                    is_self: record.id == actor.user_id,
                },
            )?;

            record.active = active;
            tx_save(users, user_id, &record)?;
            Ok(record)
        })?;

        info!(user = user_id, active, by = %actor.user_id, "user active flag changed");
        Ok(record)
    }

    /// Resolve the acting user for an id supplied by the identity provider.
    /// Unknown or inactive users are treated as signed out.
    pub fn actor_for(&self, user_id: &str) -> Result<Actor> {
        match store::load::<UserRecord>(&self.store.users, user_id)? {
            Some(record) if record.active => Ok(Actor::new(record.id, record.role)),
            _ => Err(WorkflowError::Unauthorized),
        }
    }
}
