//! Multi-entity units of work: booking, cancellation, the maintenance
//! cascade and no-show marking.
//!
//! Every operation validates first, then builds the complete list of events
//! for the unit of work and commits it through one journal frame. A
//! rejected or failed operation therefore mutates nothing. Notifications
//! go out only after the commit.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify;

use super::conflict::{check_admission, validate_request};
use super::ledger::penalty_once;
use super::{Engine, EngineError, EntityKind, StatusTrigger};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub facility_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub participants: u32,
    pub purpose: Option<String>,
}

/// New slot for an existing reservation. The user stays the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reschedule {
    /// Facility to move to. `None` keeps the current one.
    pub facility_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub participants: u32,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The reservation no longer exists; nothing to do.
    AlreadyGone,
    Cancelled {
        reservation: Reservation,
        /// Set when the cancellation was late and no penalty for it existed.
        penalty: Option<Penalty>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceOutcome {
    pub request: MaintenanceRequest,
    pub facility_status: FacilityStatus,
    /// Reservations cancelled by this transition.
    pub cancelled: Vec<Reservation>,
}

fn late_cancellation_cause(id: Ulid) -> String {
    format!("late cancellation for reservation {id}")
}

fn no_show_cause(reservation: &Reservation) -> String {
    format!("no-show: {} for reservation {}", reservation.date, reservation.id)
}

fn maintenance_reason(request: &MaintenanceRequest) -> String {
    format!("Urgent maintenance: {}", request.issue_type)
}

/// Starts strictly after `now` and strictly before `now + 24h`.
fn is_late_cancellation(reservation: &Reservation, now: NaiveDateTime) -> bool {
    let starts_at = reservation.starts_at();
    starts_at > now && starts_at < now + TimeDelta::hours(LATE_CANCELLATION_WINDOW_HOURS)
}

fn record_rejection(err: &EngineError) {
    metrics::counter!(
        crate::observability::BOOKING_REJECTIONS_TOTAL,
        "reason" => crate::observability::rejection_label(err)
    )
    .increment(1);
}

impl Engine {
    /// Book a slot. Checks run in a fixed order and the first failure wins:
    /// interval shape, lead time, facility status, capacity, facility
    /// overlap, user overlap. The facility and user locks are held from the
    /// overlap checks through the insert.
    pub async fn attempt_booking(
        &self,
        request: BookingRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let result = self.attempt_booking_inner(request, now).await;
        if let Err(e) = &result {
            record_rejection(e);
            debug!("booking rejected: {e}");
        }
        result
    }

    async fn attempt_booking_inner(
        &self,
        request: BookingRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let range = validate_request(
            request.date,
            TimeRange::try_new(request.start, request.end),
            request.participants,
            request.purpose.as_deref(),
            now,
        )?;

        let mut fs = self.lock_facility(request.facility_id).await?;
        let mut users = self.lock_users([request.user_id]).await?;
        let us = &users[&request.user_id];
        check_admission(&fs, us, request.date, &range, request.participants, None)?;

        let reservation = Reservation {
            id: Ulid::new(),
            facility_id: request.facility_id,
            user_id: request.user_id,
            date: request.date,
            range,
            participants: request.participants,
            purpose: request.purpose,
        };
        let user = us.user.clone();

        let event = Event::ReservationBooked { reservation: reservation.clone() };
        self.persist_and_apply(&[event], Some(&mut *fs), &mut users).await?;

        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        info!(
            reservation = %reservation.id,
            facility = %reservation.facility_id,
            user = %reservation.user_id,
            "booked {} {}-{}",
            reservation.date,
            reservation.range.start,
            reservation.range.end
        );
        self.notify(notify::booking_confirmed(&user, &fs.facility, &reservation));
        Ok(reservation)
    }

    /// Move an existing reservation to a new slot, optionally on another
    /// facility. Runs the booking checks with the reservation itself
    /// excluded. A move between facilities is one unit of work: the old
    /// slot is released and the new one taken in the same journal frame.
    pub async fn reschedule_booking(
        &self,
        reservation_id: Ulid,
        change: Reschedule,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let range = validate_request(
            change.date,
            TimeRange::try_new(change.start, change.end),
            change.participants,
            change.purpose.as_deref(),
            now,
        )?;

        let current_facility = self
            .get_facility_for_entity(&reservation_id)
            .ok_or(EngineError::not_found(EntityKind::Reservation, reservation_id))?;
        match change.facility_id {
            Some(target) if target != current_facility => {
                self.move_booking(reservation_id, current_facility, target, range, change)
                    .await
            }
            _ => self.reschedule_in_place(reservation_id, range, change).await,
        }
    }

    async fn reschedule_in_place(
        &self,
        reservation_id: Ulid,
        range: TimeRange,
        change: Reschedule,
    ) -> Result<Reservation, EngineError> {
        let mut fs = self
            .resolve_entity_write(reservation_id, EntityKind::Reservation)
            .await?;
        let current = fs
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Reservation, reservation_id))?;
        let mut users = self.lock_users([current.user_id]).await?;
        check_admission(
            &fs,
            &users[&current.user_id],
            change.date,
            &range,
            change.participants,
            Some(reservation_id),
        )?;

        let updated = Reservation {
            date: change.date,
            range,
            participants: change.participants,
            purpose: change.purpose,
            ..current
        };
        let event = Event::ReservationRescheduled { reservation: updated.clone() };
        self.persist_and_apply(&[event], Some(&mut *fs), &mut users).await?;
        info!(reservation = %reservation_id, "rescheduled to {} {}-{}", updated.date, updated.range.start, updated.range.end);
        Ok(updated)
    }

    async fn move_booking(
        &self,
        reservation_id: Ulid,
        from: Ulid,
        to: Ulid,
        range: TimeRange,
        change: Reschedule,
    ) -> Result<Reservation, EngineError> {
        // Two facilities are locked in id order.
        let (mut source, mut target) = if from < to {
            let source = self.lock_facility(from).await?;
            (source, self.lock_facility(to).await?)
        } else {
            let target = self.lock_facility(to).await?;
            (self.lock_facility(from).await?, target)
        };
        let current = source
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Reservation, reservation_id))?;
        let mut users = self.lock_users([current.user_id]).await?;
        check_admission(
            &target,
            &users[&current.user_id],
            change.date,
            &range,
            change.participants,
            Some(reservation_id),
        )?;
        if target.reservations.len() >= MAX_RESERVATIONS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many reservations on facility"));
        }

        let moved = Reservation {
            facility_id: to,
            date: change.date,
            range,
            participants: change.participants,
            purpose: change.purpose,
            ..current
        };
        let events = [
            Event::ReservationCancelled {
                id: reservation_id,
                facility_id: from,
                user_id: moved.user_id,
            },
            Event::ReservationBooked { reservation: moved.clone() },
        ];
        self.persist_and_apply_across(&events, &mut [&mut *source, &mut *target], &mut users)
            .await?;
        info!(
            reservation = %reservation_id,
            from = %from,
            to = %to,
            "moved to {} {}-{}",
            moved.date,
            moved.range.start,
            moved.range.end
        );
        Ok(moved)
    }

    /// Cancel a reservation. A reservation starting within the next 24 hours
    /// earns its user a penalty, recorded in the same unit of work as the
    /// deletion. Cancelling something already gone succeeds with
    /// [`CancelOutcome::AlreadyGone`].
    pub async fn cancel_booking(
        &self,
        reservation_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<CancelOutcome, EngineError> {
        let mut fs = match self
            .resolve_entity_write(reservation_id, EntityKind::Reservation)
            .await
        {
            Ok(fs) => fs,
            Err(EngineError::NotFound { entity: EntityKind::Reservation, .. }) => {
                debug!(reservation = %reservation_id, "cancel: already gone");
                return Ok(CancelOutcome::AlreadyGone);
            }
            Err(e) => return Err(e),
        };
        let Some(reservation) = fs.reservation(reservation_id).cloned() else {
            return Ok(CancelOutcome::AlreadyGone);
        };
        let mut users = self.lock_users([reservation.user_id]).await?;
        let us = &users[&reservation.user_id];

        let late = is_late_cancellation(&reservation, now);
        let penalty = if late {
            penalty_once(us, late_cancellation_cause(reservation_id), now)
        } else {
            None
        };
        let user = us.user.clone();

        let mut events = Vec::with_capacity(2);
        if let Some(p) = &penalty {
            events.push(Event::PenaltyIssued { penalty: p.clone() });
        }
        events.push(Event::ReservationCancelled {
            id: reservation_id,
            facility_id: reservation.facility_id,
            user_id: reservation.user_id,
        });
        self.persist_and_apply(&events, Some(&mut *fs), &mut users).await?;

        let kind = if late { "late" } else { "free" };
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "kind" => kind).increment(1);
        info!(reservation = %reservation_id, user = %reservation.user_id, kind, "cancelled");
        if let Some(p) = &penalty {
            metrics::counter!(crate::observability::PENALTIES_ISSUED_TOTAL, "cause" => "late_cancellation")
                .increment(1);
            self.notify(notify::penalty_issued(&user, p));
        }
        Ok(CancelOutcome::Cancelled { reservation, penalty })
    }

    /// Move a maintenance request to in-progress: close the facility and
    /// cancel every reservation on it that has not started yet, notifying
    /// each member. Status flip and cancellations commit together or not
    /// at all.
    pub async fn enter_maintenance(
        &self,
        request_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<MaintenanceOutcome, EngineError> {
        let mut fs = self
            .resolve_entity_write(request_id, EntityKind::MaintenanceRequest)
            .await?;
        let mut request = fs
            .maintenance_request(request_id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::MaintenanceRequest, request_id))?;
        if request.status == MaintenanceStatus::InProgress {
            return Err(EngineError::Validation("maintenance request is already in progress"));
        }

        let facility_id = fs.facility.id;
        let affected: Vec<Reservation> = fs.starting_after(now).cloned().collect();
        let mut users = self.lock_users(affected.iter().map(|r| r.user_id)).await?;

        let mut events = Vec::with_capacity(affected.len() + 2);
        events.push(Event::MaintenanceStatusChanged {
            id: request_id,
            facility_id,
            status: MaintenanceStatus::InProgress,
        });
        let next = fs.facility.status.on(StatusTrigger::MaintenanceStarted);
        if next != fs.facility.status {
            events.push(Event::FacilityStatusChanged { id: facility_id, status: next });
        }
        for r in &affected {
            events.push(Event::ReservationCancelled {
                id: r.id,
                facility_id,
                user_id: r.user_id,
            });
        }
        self.persist_and_apply(&events, Some(&mut *fs), &mut users).await?;
        request.status = MaintenanceStatus::InProgress;

        metrics::counter!(crate::observability::CASCADE_CANCELLATIONS_TOTAL).increment(affected.len() as u64);
        info!(
            request = %request_id,
            facility = %facility_id,
            cancelled = affected.len(),
            "maintenance started, facility closed"
        );

        let reason = maintenance_reason(&request);
        for r in &affected {
            if let Some(us) = users.get(&r.user_id) {
                self.notify(notify::maintenance_cancellation(&us.user, &fs.facility, r, &reason));
            }
        }

        Ok(MaintenanceOutcome {
            request,
            facility_status: fs.facility.status,
            cancelled: affected,
        })
    }

    /// Resolve a maintenance request. The facility reopens only if no other
    /// unresolved request remains for it.
    pub async fn resolve_maintenance(&self, request_id: Ulid) -> Result<MaintenanceOutcome, EngineError> {
        let mut fs = self
            .resolve_entity_write(request_id, EntityKind::MaintenanceRequest)
            .await?;
        let mut request = fs
            .maintenance_request(request_id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::MaintenanceRequest, request_id))?;

        let facility_id = fs.facility.id;
        let others_active = fs.has_active_maintenance(Some(request_id));
        let next = fs
            .facility
            .status
            .on(StatusTrigger::MaintenanceResolved { others_active });

        let mut events = Vec::with_capacity(2);
        if request.status != MaintenanceStatus::Resolved {
            events.push(Event::MaintenanceStatusChanged {
                id: request_id,
                facility_id,
                status: MaintenanceStatus::Resolved,
            });
        }
        if next != fs.facility.status {
            events.push(Event::FacilityStatusChanged { id: facility_id, status: next });
        }
        self.persist_and_apply(&events, Some(&mut *fs), &mut Default::default()).await?;
        request.status = MaintenanceStatus::Resolved;

        if others_active {
            info!(request = %request_id, facility = %facility_id, "maintenance resolved, other requests still open");
        } else {
            info!(request = %request_id, facility = %facility_id, status = %fs.facility.status, "maintenance resolved");
        }
        Ok(MaintenanceOutcome {
            request,
            facility_status: fs.facility.status,
            cancelled: Vec::new(),
        })
    }

    /// Record a no-show. Too early (inside the grace period after the start)
    /// is a no-op, as is a second call for the same reservation. The
    /// reservation itself is kept.
    pub async fn mark_no_show(
        &self,
        reservation_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<Option<Penalty>, EngineError> {
        let mut fs = self
            .resolve_entity_write(reservation_id, EntityKind::Reservation)
            .await?;
        let reservation = fs
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Reservation, reservation_id))?;

        if now < reservation.starts_at() + TimeDelta::minutes(NO_SHOW_GRACE_MINUTES) {
            debug!(reservation = %reservation_id, "no-show: too early to judge");
            return Ok(None);
        }

        let mut users = self.lock_users([reservation.user_id]).await?;
        let us = &users[&reservation.user_id];
        let Some(penalty) = penalty_once(us, no_show_cause(&reservation), now) else {
            return Ok(None);
        };
        let user = us.user.clone();

        let event = Event::PenaltyIssued { penalty: penalty.clone() };
        self.persist_and_apply(&[event], Some(&mut *fs), &mut users).await?;

        metrics::counter!(crate::observability::PENALTIES_ISSUED_TOTAL, "cause" => "no_show").increment(1);
        info!(reservation = %reservation_id, user = %reservation.user_id, "no-show recorded");
        self.notify(notify::penalty_issued(&user, &penalty));
        Ok(Some(penalty))
    }
}
