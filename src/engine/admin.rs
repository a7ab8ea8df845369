use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::{FacilityState, UserState};
use super::{ConflictReason, Engine, EngineError, EntityKind, StatusTrigger};

fn required(value: &str, missing: &'static str, max: usize, too_long: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(missing));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(())
}

fn validate_facility_fields(name: &str, kind: &str) -> Result<(), EngineError> {
    required(name, "facility name is required", MAX_NAME_LEN, "facility name too long")?;
    required(kind, "facility type is required", MAX_NAME_LEN, "facility type too long")
}

impl Engine {
    pub async fn register_user(
        &self,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Result<User, EngineError> {
        let (name, email) = (name.into(), email.into());
        required(&name, "user name is required", MAX_NAME_LEN, "user name too long")?;
        required(&email, "email is required", MAX_EMAIL_LEN, "email too long")?;
        if !email.contains('@') {
            return Err(EngineError::Validation("email address is malformed"));
        }

        let _gate = self.compaction_gate.read().await;
        let user = User { id: Ulid::new(), name, email };
        let event = Event::UserRegistered {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
        };
        self.wal_append(&[event]).await?;
        self.users
            .insert(user.id, Arc::new(RwLock::new(UserState::new(user.clone()))));
        info!(user = %user.id, "user registered");
        Ok(user)
    }

    /// New facilities start out available.
    pub async fn create_facility(
        &self,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<Facility, EngineError> {
        let (name, kind) = (name.into(), kind.into());
        validate_facility_fields(&name, &kind)?;

        let _gate = self.compaction_gate.read().await;
        let facility = Facility {
            id: Ulid::new(),
            name,
            kind,
            status: FacilityStatus::Available,
        };
        let event = Event::FacilityCreated {
            id: facility.id,
            name: facility.name.clone(),
            kind: facility.kind.clone(),
            status: facility.status,
        };
        self.wal_append(&[event]).await?;
        self.facilities.insert(
            facility.id,
            Arc::new(RwLock::new(FacilityState::new(facility.clone()))),
        );
        info!(facility = %facility.id, kind = %facility.kind, "facility created");
        Ok(facility)
    }

    /// Rename or re-type a facility. Existing reservations are kept even if
    /// the new type has a smaller capacity.
    pub async fn update_facility(
        &self,
        id: Ulid,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<Facility, EngineError> {
        let (name, kind) = (name.into(), kind.into());
        validate_facility_fields(&name, &kind)?;

        let mut fs = self.lock_facility(id).await?;
        let event = Event::FacilityUpdated { id, name, kind };
        self.persist_and_apply(&[event], Some(&mut *fs), &mut Default::default())
            .await?;
        Ok(fs.facility.clone())
    }

    /// Refused while the facility still has reservations; cancel them first.
    pub async fn delete_facility(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let fs = self.lock_facility(id).await?;
        if !fs.reservations.is_empty() {
            return Err(EngineError::HasReservations(id));
        }

        self.wal_append(&[Event::FacilityDeleted { id }]).await?;
        self.facilities.remove(&id);
        for request in &fs.maintenance {
            self.entity_to_facility.remove(&request.id);
        }
        info!(facility = %id, "facility deleted");
        Ok(())
    }

    /// Staff close or reopen. Reopening is refused while a maintenance
    /// request on the facility is in progress.
    pub async fn set_facility_status(
        &self,
        id: Ulid,
        status: FacilityStatus,
    ) -> Result<FacilityStatus, EngineError> {
        let mut fs = self.lock_facility(id).await?;
        let trigger = match status {
            FacilityStatus::Available => {
                if fs.has_maintenance_in_progress() {
                    return Err(EngineError::conflict(ConflictReason::FacilityUnavailable));
                }
                StatusTrigger::ManualReopen
            }
            FacilityStatus::Unavailable => StatusTrigger::ManualClose,
        };
        let next = fs.facility.status.on(trigger);
        if next != fs.facility.status {
            let event = Event::FacilityStatusChanged { id, status: next };
            self.persist_and_apply(&[event], Some(&mut *fs), &mut Default::default())
                .await?;
            info!(facility = %id, status = %next, "facility status set");
        }
        Ok(next)
    }

    /// File a new maintenance request. It starts out pending and does not
    /// touch the facility's status until work begins.
    pub async fn report_maintenance(
        &self,
        facility_id: Ulid,
        reporter_id: Ulid,
        issue_type: impl Into<String>,
        severity: impl Into<String>,
        description: Option<String>,
        reported_at: NaiveDateTime,
    ) -> Result<MaintenanceRequest, EngineError> {
        let (issue_type, severity) = (issue_type.into(), severity.into());
        required(&issue_type, "issue type is required", MAX_NAME_LEN, "issue type too long")?;
        required(&severity, "severity is required", MAX_NAME_LEN, "severity too long")?;
        if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if !self.users.contains_key(&reporter_id) {
            return Err(EngineError::not_found(EntityKind::User, reporter_id));
        }

        let mut fs = self.lock_facility(facility_id).await?;
        let request = MaintenanceRequest {
            id: Ulid::new(),
            facility_id,
            reporter_id,
            issue_type,
            severity,
            description,
            status: MaintenanceStatus::Pending,
            reported_at,
        };
        let event = Event::MaintenanceReported { request: request.clone() };
        self.persist_and_apply(&[event], Some(&mut *fs), &mut Default::default())
            .await?;
        info!(request = %request.id, facility = %facility_id, issue = %request.issue_type, "maintenance reported");
        Ok(request)
    }

    /// Remove a request that is pending or resolved. An in-progress request
    /// must be resolved first so the facility status stays consistent.
    pub async fn delete_maintenance_request(&self, id: Ulid) -> Result<(), EngineError> {
        let mut fs = self
            .resolve_entity_write(id, EntityKind::MaintenanceRequest)
            .await?;
        let request = fs
            .maintenance_request(id)
            .ok_or(EngineError::not_found(EntityKind::MaintenanceRequest, id))?;
        if request.status == MaintenanceStatus::InProgress {
            return Err(EngineError::Validation(
                "maintenance request in progress; resolve it first",
            ));
        }
        let event = Event::MaintenanceDeleted { id, facility_id: fs.facility.id };
        self.persist_and_apply(&[event], Some(&mut *fs), &mut Default::default())
            .await?;
        Ok(())
    }
}
