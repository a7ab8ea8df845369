use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open wall-clock interval `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// Returns `None` unless `start < end`.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_time(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacilityStatus {
    Available,
    Unavailable,
}

impl std::fmt::Display for FacilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacilityStatus::Available => write!(f, "Available"),
            FacilityStatus::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// Player count when the sport type is not recognised.
pub const DEFAULT_CAPACITY: u32 = 8;

/// Maximum participants for a sport type. Matching is a case-insensitive
/// substring match, so "Indoor Tennis Court" resolves to tennis.
pub fn capacity_for_type(kind: &str) -> u32 {
    let t = kind.to_lowercase();
    if t.contains("soccer") || t.contains("football") {
        22
    } else if t.contains("basketball") {
        10
    } else if t.contains("tennis") || t.contains("padel") {
        4
    } else if t.contains("badminton") {
        6
    } else if t.contains("ping") || t.contains("pong") {
        2
    } else {
        DEFAULT_CAPACITY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Ulid,
    pub name: String,
    /// Sport category, free-form ("tennis", "5-a-side football", ...).
    pub kind: String,
    pub status: FacilityStatus,
}

impl Facility {
    pub fn capacity(&self) -> u32 {
        capacity_for_type(&self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub participants: u32,
    pub purpose: Option<String>,
}

impl Reservation {
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.start)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.end)
    }

    /// Sort key used by every per-facility and per-user reservation list.
    pub(crate) fn sort_key(&self) -> (NaiveDate, NaiveTime) {
        (self.date, self.range.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceStatus {
    Pending,
    InProgress,
    Resolved,
}

impl MaintenanceStatus {
    /// Anything not yet resolved counts as active.
    pub fn is_active(self) -> bool {
        self != MaintenanceStatus::Resolved
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub reporter_id: Ulid,
    pub issue_type: String,
    pub severity: String,
    pub description: Option<String>,
    pub status: MaintenanceStatus,
    pub reported_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Penalty {
    pub id: Ulid,
    pub user_id: Ulid,
    /// Cause text. Unique per user.
    pub description: String,
    pub issued_at: NaiveDateTime,
}

/// Journal record. One unit of work is persisted as a `Vec<Event>` in a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
    },
    FacilityCreated {
        id: Ulid,
        name: String,
        kind: String,
        status: FacilityStatus,
    },
    FacilityUpdated {
        id: Ulid,
        name: String,
        kind: String,
    },
    FacilityStatusChanged {
        id: Ulid,
        status: FacilityStatus,
    },
    FacilityDeleted {
        id: Ulid,
    },
    ReservationBooked {
        reservation: Reservation,
    },
    ReservationRescheduled {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        facility_id: Ulid,
        user_id: Ulid,
    },
    MaintenanceReported {
        request: MaintenanceRequest,
    },
    MaintenanceStatusChanged {
        id: Ulid,
        facility_id: Ulid,
        status: MaintenanceStatus,
    },
    MaintenanceDeleted {
        id: Ulid,
        facility_id: Ulid,
    },
    PenaltyIssued {
        penalty: Penalty,
    },
    PenaltiesExpired {
        user_id: Ulid,
        ids: Vec<Ulid>,
    },
    /// Staff correction of an existing penalty's cause or date.
    PenaltyAmended {
        penalty: Penalty,
    },
    PenaltyRevoked {
        user_id: Ulid,
        id: Ulid,
    },
}

impl Event {
    /// Facility whose state this event mutates, if any.
    pub fn facility_id(&self) -> Option<Ulid> {
        match self {
            Event::FacilityUpdated { id, .. }
            | Event::FacilityStatusChanged { id, .. } => Some(*id),
            Event::ReservationBooked { reservation }
            | Event::ReservationRescheduled { reservation } => Some(reservation.facility_id),
            Event::ReservationCancelled { facility_id, .. }
            | Event::MaintenanceStatusChanged { facility_id, .. }
            | Event::MaintenanceDeleted { facility_id, .. } => Some(*facility_id),
            Event::MaintenanceReported { request } => Some(request.facility_id),
            // Created/Deleted are handled at the map level, not per record
            Event::FacilityCreated { .. }
            | Event::FacilityDeleted { .. }
            | Event::UserRegistered { .. }
            | Event::PenaltyIssued { .. }
            | Event::PenaltiesExpired { .. }
            | Event::PenaltyAmended { .. }
            | Event::PenaltyRevoked { .. } => None,
        }
    }

    /// User whose state this event mutates, if any.
    pub fn user_id(&self) -> Option<Ulid> {
        match self {
            Event::ReservationBooked { reservation }
            | Event::ReservationRescheduled { reservation } => Some(reservation.user_id),
            Event::ReservationCancelled { user_id, .. }
            | Event::PenaltiesExpired { user_id, .. }
            | Event::PenaltyRevoked { user_id, .. } => Some(*user_id),
            Event::PenaltyIssued { penalty } | Event::PenaltyAmended { penalty } => Some(penalty.user_id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Facility row plus the derived values a dashboard card needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityInfo {
    pub facility: Facility,
    pub capacity: u32,
    pub has_active_maintenance: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn range_basics() {
        let r = TimeRange::new(t(10, 0), t(11, 0));
        assert_eq!(r.duration(), TimeDelta::hours(1));
        assert!(r.contains_time(t(10, 0)));
        assert!(r.contains_time(t(10, 59)));
        assert!(!r.contains_time(t(11, 0))); // half-open
    }

    #[test]
    fn range_overlap() {
        let a = TimeRange::new(t(10, 0), t(11, 0));
        let b = TimeRange::new(t(10, 30), t(11, 30));
        let c = TimeRange::new(t(11, 0), t(12, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn range_enclosing_overlaps() {
        let outer = TimeRange::new(t(8, 0), t(20, 0));
        let inner = TimeRange::new(t(12, 0), t(12, 15));
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn range_try_new_rejects_empty_and_inverted() {
        assert!(TimeRange::try_new(t(10, 0), t(10, 0)).is_none());
        assert!(TimeRange::try_new(t(11, 0), t(10, 0)).is_none());
        assert!(TimeRange::try_new(t(10, 0), t(10, 1)).is_some());
    }

    #[test]
    fn capacity_lookup() {
        assert_eq!(capacity_for_type("Soccer"), 22);
        assert_eq!(capacity_for_type("5-a-side football"), 22);
        assert_eq!(capacity_for_type("basketball"), 10);
        assert_eq!(capacity_for_type("Tennis"), 4);
        assert_eq!(capacity_for_type("padel"), 4);
        assert_eq!(capacity_for_type("badminton"), 6);
        assert_eq!(capacity_for_type("Ping-Pong"), 2);
        assert_eq!(capacity_for_type("climbing wall"), DEFAULT_CAPACITY);
        assert_eq!(capacity_for_type(""), DEFAULT_CAPACITY);
    }

    #[test]
    fn reservation_instants() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let r = Reservation {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            user_id: Ulid::new(),
            date,
            range: TimeRange::new(t(10, 0), t(11, 0)),
            participants: 2,
            purpose: None,
        };
        assert_eq!(r.starts_at(), date.and_time(t(10, 0)));
        assert_eq!(r.ends_at(), date.and_time(t(11, 0)));
    }

    #[test]
    fn maintenance_active() {
        assert!(MaintenanceStatus::Pending.is_active());
        assert!(MaintenanceStatus::InProgress.is_active());
        assert!(!MaintenanceStatus::Resolved.is_active());
    }

    #[test]
    fn event_routing() {
        let fid = Ulid::new();
        let uid = Ulid::new();
        let cancelled = Event::ReservationCancelled {
            id: Ulid::new(),
            facility_id: fid,
            user_id: uid,
        };
        assert_eq!(cancelled.facility_id(), Some(fid));
        assert_eq!(cancelled.user_id(), Some(uid));

        let status = Event::FacilityStatusChanged {
            id: fid,
            status: FacilityStatus::Unavailable,
        };
        assert_eq!(status.facility_id(), Some(fid));
        assert_eq!(status.user_id(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let frame = vec![
            Event::FacilityCreated {
                id: Ulid::new(),
                name: "Court 1".into(),
                kind: "tennis".into(),
                status: FacilityStatus::Available,
            },
            Event::PenaltyIssued {
                penalty: Penalty {
                    id: Ulid::new(),
                    user_id: Ulid::new(),
                    description: "late cancellation for reservation x".into(),
                    issued_at: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_time(t(9, 0)),
                },
            },
        ];
        let bytes = bincode::serialize(&frame).unwrap();
        let decoded: Vec<Event> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }
}
