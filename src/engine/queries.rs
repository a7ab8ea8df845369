use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::conflict;
use super::store::FacilityState;
use super::{Engine, EngineError, EntityKind};

fn facility_info(fs: &FacilityState) -> FacilityInfo {
    FacilityInfo {
        facility: fs.facility.clone(),
        capacity: fs.facility.capacity(),
        has_active_maintenance: fs.has_active_maintenance(None),
    }
}

fn candidate_range(start: NaiveTime, end: NaiveTime) -> Result<TimeRange, EngineError> {
    TimeRange::try_new(start, end).ok_or(EngineError::Validation("end time must be after start time"))
}

impl Engine {
    // ── Conflict checks ──────────────────────────────────────

    /// Would `[start, end)` on `date` overlap a live reservation on the
    /// facility? `exclude` skips the reservation being edited.
    pub async fn has_facility_conflict(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let range = candidate_range(start, end)?;
        let fs = self.read_facility(facility_id).await?;
        Ok(conflict::has_facility_conflict(&fs, date, &range, exclude))
    }

    /// Would `[start, end)` on `date` overlap any of the user's live
    /// reservations, on any facility?
    pub async fn has_user_conflict(
        &self,
        user_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let range = candidate_range(start, end)?;
        let us = self.read_user(user_id).await?;
        Ok(conflict::has_user_conflict(&us, date, &range, exclude))
    }

    // ── Facilities ───────────────────────────────────────────

    pub async fn facility(&self, id: Ulid) -> Result<FacilityInfo, EngineError> {
        let fs = self.read_facility(id).await?;
        Ok(facility_info(&fs))
    }

    /// All facilities, ordered by name.
    pub async fn facilities(&self) -> Vec<FacilityInfo> {
        let records: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(records.len());
        for fs in records {
            out.push(facility_info(&*fs.read().await));
        }
        out.sort_by(|a, b| a.facility.name.cmp(&b.facility.name));
        out
    }

    pub async fn capacity_of(&self, facility_id: Ulid) -> Result<u32, EngineError> {
        let fs = self.read_facility(facility_id).await?;
        Ok(fs.facility.capacity())
    }

    pub async fn has_active_maintenance(&self, facility_id: Ulid) -> Result<bool, EngineError> {
        let fs = self.read_facility(facility_id).await?;
        Ok(fs.has_active_maintenance(None))
    }

    /// Maintenance requests across all facilities, newest first. `status`
    /// narrows to one state.
    pub async fn maintenance_requests(&self, status: Option<MaintenanceStatus>) -> Vec<MaintenanceRequest> {
        let records: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for fs in records {
            let guard = fs.read().await;
            out.extend(
                guard
                    .maintenance
                    .iter()
                    .filter(|m| status.is_none_or(|s| m.status == s))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.reported_at.cmp(&a.reported_at).then(b.id.cmp(&a.id)));
        out
    }

    // ── Reservations ─────────────────────────────────────────

    pub async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let not_found = || EngineError::not_found(EntityKind::Reservation, id);
        let facility_id = self.get_facility_for_entity(&id).ok_or_else(not_found)?;
        let fs = self.read_facility(facility_id).await.map_err(|_| not_found())?;
        fs.reservation(id).cloned().ok_or_else(not_found)
    }

    /// A facility's reservations on one date, by start time.
    pub async fn reservations_on(&self, facility_id: Ulid, date: NaiveDate) -> Result<Vec<Reservation>, EngineError> {
        let fs = self.read_facility(facility_id).await?;
        Ok(fs.on_date(date).to_vec())
    }

    /// A user's live reservations across all facilities, by date and start.
    pub async fn reservations_for_user(&self, user_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let us = self.read_user(user_id).await?;
        Ok(us.reservations.clone())
    }

    /// Every reservation dated within `from..=to`, by date and start.
    pub async fn reservations_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<Reservation> {
        let records: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for fs in records {
            let guard = fs.read().await;
            let lo = guard.reservations.partition_point(|r| r.date < from);
            let hi = guard.reservations.partition_point(|r| r.date <= to);
            if lo < hi {
                out.extend_from_slice(&guard.reservations[lo..hi]);
            }
        }
        out.sort_by_key(|r| (r.date, r.range.start, r.facility_id));
        out
    }

    // ── Users and penalties ──────────────────────────────────

    pub async fn user(&self, id: Ulid) -> Result<User, EngineError> {
        Ok(self.read_user(id).await?.user.clone())
    }

    pub async fn penalties_for_user(&self, user_id: Ulid) -> Result<Vec<Penalty>, EngineError> {
        let us = self.read_user(user_id).await?;
        Ok(us.penalties.clone())
    }

    /// Every penalty on record, newest first.
    pub async fn all_penalties(&self) -> Vec<Penalty> {
        let records: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for us in records {
            out.extend(us.read().await.penalties.iter().cloned());
        }
        out.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then(b.id.cmp(&a.id)));
        out
    }
}
