use std::net::SocketAddr;

use crate::engine::{ConflictReason, EngineError};

// ── Booking flow ────────────────────────────────────────────────

/// Counter: reservations created.
pub const BOOKINGS_TOTAL: &str = "courtside_bookings_total";

/// Counter: booking attempts refused. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "courtside_booking_rejections_total";

/// Counter: reservations cancelled by their user. Labels: kind (free, late).
pub const CANCELLATIONS_TOTAL: &str = "courtside_cancellations_total";

/// Counter: reservations cancelled because maintenance started.
pub const CASCADE_CANCELLATIONS_TOTAL: &str = "courtside_cascade_cancellations_total";

// ── Penalty ledger ──────────────────────────────────────────────

/// Counter: penalties recorded. Labels: cause (late_cancellation, no_show, manual).
pub const PENALTIES_ISSUED_TOTAL: &str = "courtside_penalties_issued_total";

/// Counter: penalties removed by expiry.
pub const PENALTIES_EXPIRED_TOTAL: &str = "courtside_penalties_expired_total";

/// Counter: penalties deleted by staff.
pub const PENALTIES_REVOKED_TOTAL: &str = "courtside_penalties_revoked_total";

/// Counter: scheduled expiry runs. Labels: status (ok, error).
pub const EXPIRY_RUNS_TOTAL: &str = "courtside_expiry_runs_total";

// ── Notifications ───────────────────────────────────────────────

pub const NOTIFICATIONS_SENT_TOTAL: &str = "courtside_notifications_sent_total";

pub const NOTIFICATION_FAILURES_TOTAL: &str = "courtside_notification_failures_total";

/// Counter: messages dropped because the delivery queue was full or closed.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "courtside_notifications_dropped_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (frames per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short label for a refused booking.
pub fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::Validation(_) => "validation",
        EngineError::NotFound { .. } => "not_found",
        EngineError::Conflict(ConflictReason::FacilityUnavailable) => "facility_unavailable",
        EngineError::Conflict(ConflictReason::TooManyParticipants { .. }) => "too_many_participants",
        EngineError::Conflict(ConflictReason::TimeSlotBooked) => "time_slot_booked",
        EngineError::Conflict(ConflictReason::UserDoubleBooked) => "user_double_booked",
        EngineError::Duplicate { .. } => "duplicate",
        EngineError::HasReservations(_) => "has_reservations",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::Unavailable(_) => "unavailable",
    }
}
