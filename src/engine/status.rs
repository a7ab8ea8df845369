//! Facility availability state machine.
//!
//! `Available <-> Unavailable`, driven from outside: a manual close/reopen
//! by staff, or a maintenance request starting or being resolved. There is
//! no terminal state.

use crate::model::{Facility, FacilityStatus};

use super::{ConflictReason, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTrigger {
    ManualClose,
    ManualReopen,
    MaintenanceStarted,
    /// A request was resolved. `others_active` is whether any other
    /// non-resolved request remains for the facility.
    MaintenanceResolved { others_active: bool },
}

impl FacilityStatus {
    pub fn admits_bookings(self) -> bool {
        self == FacilityStatus::Available
    }

    pub fn on(self, trigger: StatusTrigger) -> FacilityStatus {
        match trigger {
            StatusTrigger::ManualClose | StatusTrigger::MaintenanceStarted => FacilityStatus::Unavailable,
            StatusTrigger::ManualReopen => FacilityStatus::Available,
            StatusTrigger::MaintenanceResolved { others_active: false } => FacilityStatus::Available,
            StatusTrigger::MaintenanceResolved { others_active: true } => self,
        }
    }
}

pub(crate) fn ensure_admits_bookings(facility: &Facility) -> Result<(), EngineError> {
    if facility.status.admits_bookings() {
        Ok(())
    } else {
        Err(EngineError::conflict(ConflictReason::FacilityUnavailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FacilityStatus::*;

    #[test]
    fn only_available_admits_bookings() {
        assert!(Available.admits_bookings());
        assert!(!Unavailable.admits_bookings());
    }

    #[test]
    fn maintenance_start_closes_from_any_state() {
        assert_eq!(Available.on(StatusTrigger::MaintenanceStarted), Unavailable);
        assert_eq!(Unavailable.on(StatusTrigger::MaintenanceStarted), Unavailable);
    }

    #[test]
    fn last_resolution_reopens() {
        let t = StatusTrigger::MaintenanceResolved { others_active: false };
        assert_eq!(Unavailable.on(t), Available);
    }

    #[test]
    fn resolution_with_others_active_keeps_state() {
        let t = StatusTrigger::MaintenanceResolved { others_active: true };
        assert_eq!(Unavailable.on(t), Unavailable);
        assert_eq!(Available.on(t), Available);
    }

    #[test]
    fn manual_transitions() {
        assert_eq!(Available.on(StatusTrigger::ManualClose), Unavailable);
        assert_eq!(Unavailable.on(StatusTrigger::ManualReopen), Available);
        assert_eq!(Available.on(StatusTrigger::ManualReopen), Available);
    }
}
