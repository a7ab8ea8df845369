use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Facility,
    User,
    Reservation,
    MaintenanceRequest,
    Penalty,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Facility => write!(f, "facility"),
            EntityKind::User => write!(f, "user"),
            EntityKind::Reservation => write!(f, "reservation"),
            EntityKind::MaintenanceRequest => write!(f, "maintenance request"),
            EntityKind::Penalty => write!(f, "penalty"),
        }
    }
}

/// Why a booking was refused. Display strings are the canonical reasons
/// shown to members and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    FacilityUnavailable,
    TimeSlotBooked,
    UserDoubleBooked,
    TooManyParticipants { requested: u32, capacity: u32 },
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::FacilityUnavailable => write!(f, "Facility unavailable"),
            ConflictReason::TimeSlotBooked => write!(f, "Time slot booked"),
            ConflictReason::UserDoubleBooked => write!(f, "You have another booking"),
            ConflictReason::TooManyParticipants { .. } => write!(f, "Too many participants"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input. Never retried.
    #[error("invalid input: {0}")]
    Validation(&'static str),
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: Ulid },
    #[error("{0}")]
    Conflict(ConflictReason),
    /// A penalty with the same cause already exists for this user.
    #[error("penalty already recorded for user {user_id}: {description}")]
    Duplicate { user_id: Ulid, description: String },
    #[error("cannot delete facility {0}: it still has reservations")]
    HasReservations(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// The journal could not be written. Nothing was applied; retry is safe.
    #[error("store unavailable, retry: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn not_found(entity: EntityKind, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn conflict(reason: ConflictReason) -> Self {
        EngineError::Conflict(reason)
    }

    /// Human-readable reason for the presentation layer.
    pub fn reason(&self) -> String {
        match self {
            EngineError::Validation(msg) | EngineError::LimitExceeded(msg) => (*msg).to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }
}
