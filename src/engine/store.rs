use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Everything guarded by one facility's lock.
#[derive(Debug, Clone)]
pub struct FacilityState {
    pub facility: Facility,
    /// Live reservations, sorted by `(date, start)`.
    pub reservations: Vec<Reservation>,
    pub maintenance: Vec<MaintenanceRequest>,
}

impl FacilityState {
    pub fn new(facility: Facility) -> Self {
        Self {
            facility,
            reservations: Vec::new(),
            maintenance: Vec::new(),
        }
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations on `date`. Uses binary search on the sorted list.
    pub fn on_date(&self, date: NaiveDate) -> &[Reservation] {
        on_date(&self.reservations, date)
    }

    /// Reservations whose start instant is strictly after `now`.
    pub fn starting_after(&self, now: NaiveDateTime) -> impl Iterator<Item = &Reservation> {
        let from = self.reservations.partition_point(|r| r.date < now.date());
        self.reservations[from..]
            .iter()
            .filter(move |r| r.starts_at() > now)
    }

    pub fn maintenance_request(&self, id: Ulid) -> Option<&MaintenanceRequest> {
        self.maintenance.iter().find(|m| m.id == id)
    }

    /// Any non-resolved request other than `excluding`.
    pub fn has_active_maintenance(&self, excluding: Option<Ulid>) -> bool {
        self.maintenance
            .iter()
            .any(|m| Some(m.id) != excluding && m.status.is_active())
    }

    pub fn has_maintenance_in_progress(&self) -> bool {
        self.maintenance
            .iter()
            .any(|m| m.status == MaintenanceStatus::InProgress)
    }
}

/// Everything guarded by one user's lock: the user's own copy of their
/// reservations (for the double-booking check) and their penalties.
#[derive(Debug, Clone)]
pub struct UserState {
    pub user: User,
    /// Live reservations across all facilities, sorted by `(date, start)`.
    pub reservations: Vec<Reservation>,
    pub penalties: Vec<Penalty>,
}

impl UserState {
    pub fn new(user: User) -> Self {
        Self {
            user,
            reservations: Vec::new(),
            penalties: Vec::new(),
        }
    }

    pub fn on_date(&self, date: NaiveDate) -> &[Reservation] {
        on_date(&self.reservations, date)
    }
}

fn on_date(sorted: &[Reservation], date: NaiveDate) -> &[Reservation] {
    let lo = sorted.partition_point(|r| r.date < date);
    let hi = sorted.partition_point(|r| r.date <= date);
    &sorted[lo..hi]
}

/// Insert maintaining sort order by `(date, start)`.
fn insert_sorted(list: &mut Vec<Reservation>, reservation: Reservation) {
    let key = reservation.sort_key();
    let pos = list.partition_point(|r| r.sort_key() <= key);
    list.insert(pos, reservation);
}

fn remove_by_id(list: &mut Vec<Reservation>, id: Ulid) -> Option<Reservation> {
    let pos = list.iter().position(|r| r.id == id)?;
    Some(list.remove(pos))
}

/// Apply an event to a facility record (no locking; caller holds the lock).
/// Events that do not concern facilities are ignored.
pub(crate) fn apply_to_facility(fs: &mut FacilityState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::FacilityUpdated { name, kind, .. } => {
            fs.facility.name = name.clone();
            fs.facility.kind = kind.clone();
        }
        Event::FacilityStatusChanged { status, .. } => {
            fs.facility.status = *status;
        }
        Event::ReservationBooked { reservation } => {
            entity_map.insert(reservation.id, reservation.facility_id);
            insert_sorted(&mut fs.reservations, reservation.clone());
        }
        Event::ReservationRescheduled { reservation } => {
            remove_by_id(&mut fs.reservations, reservation.id);
            insert_sorted(&mut fs.reservations, reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            remove_by_id(&mut fs.reservations, *id);
            entity_map.remove(id);
        }
        Event::MaintenanceReported { request } => {
            entity_map.insert(request.id, request.facility_id);
            fs.maintenance.push(request.clone());
        }
        Event::MaintenanceStatusChanged { id, status, .. } => {
            if let Some(m) = fs.maintenance.iter_mut().find(|m| m.id == *id) {
                m.status = *status;
            }
        }
        Event::MaintenanceDeleted { id, .. } => {
            fs.maintenance.retain(|m| m.id != *id);
            entity_map.remove(id);
        }
        Event::UserRegistered { .. }
        | Event::FacilityCreated { .. }
        | Event::FacilityDeleted { .. }
        | Event::PenaltyIssued { .. }
        | Event::PenaltiesExpired { .. }
        | Event::PenaltyAmended { .. }
        | Event::PenaltyRevoked { .. } => {}
    }
}

/// Apply an event to a user record (no locking; caller holds the lock).
pub(crate) fn apply_to_user(us: &mut UserState, event: &Event) {
    match event {
        Event::ReservationBooked { reservation } => {
            insert_sorted(&mut us.reservations, reservation.clone());
        }
        Event::ReservationRescheduled { reservation } => {
            remove_by_id(&mut us.reservations, reservation.id);
            insert_sorted(&mut us.reservations, reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            remove_by_id(&mut us.reservations, *id);
        }
        Event::PenaltyIssued { penalty } => {
            us.penalties.push(penalty.clone());
        }
        Event::PenaltiesExpired { ids, .. } => {
            us.penalties.retain(|p| !ids.contains(&p.id));
        }
        Event::PenaltyAmended { penalty } => {
            if let Some(slot) = us.penalties.iter_mut().find(|p| p.id == penalty.id) {
                *slot = penalty.clone();
            }
        }
        Event::PenaltyRevoked { id, .. } => {
            us.penalties.retain(|p| p.id != *id);
        }
        _ => {}
    }
}

/// Events that recreate a facility record from scratch (compaction).
pub(crate) fn snapshot_facility(fs: &FacilityState, out: &mut Vec<Event>) {
    out.push(Event::FacilityCreated {
        id: fs.facility.id,
        name: fs.facility.name.clone(),
        kind: fs.facility.kind.clone(),
        status: fs.facility.status,
    });
    for request in &fs.maintenance {
        out.push(Event::MaintenanceReported { request: request.clone() });
    }
    for reservation in &fs.reservations {
        out.push(Event::ReservationBooked { reservation: reservation.clone() });
    }
}

/// Events that recreate a user record, minus reservations (those come from
/// the facility snapshots).
pub(crate) fn snapshot_user(us: &UserState, out: &mut Vec<Event>) {
    out.push(Event::UserRegistered {
        id: us.user.id,
        name: us.user.name.clone(),
        email: us.user.email.clone(),
    });
    for penalty in &us.penalties {
        out.push(Event::PenaltyIssued { penalty: penalty.clone() });
    }
}
