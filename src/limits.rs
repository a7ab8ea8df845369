//! Input limits and booking policy constants.

// ── Input limits ─────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PURPOSE_LEN: usize = 1024;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_RESERVATIONS_PER_FACILITY: usize = 100_000;

// ── Booking policy ───────────────────────────────────────────────

/// A booking must start at least this many minutes after "now".
pub const BOOKING_LEAD_MINUTES: i64 = 10;

/// Cancelling a booking that starts within this many hours is penalized.
pub const LATE_CANCELLATION_WINDOW_HOURS: i64 = 24;

/// A no-show can only be recorded this many minutes after the start.
pub const NO_SHOW_GRACE_MINUTES: i64 = 10;

/// Penalties older than this many calendar months are expired.
pub const PENALTY_RETENTION_MONTHS: u32 = 3;
