//! Hard caps on request sizes. Everything here is enforced before any write.

/// Longest recurring window accepted, in days (roughly one year).
pub const MAX_RECURRING_SPAN_DAYS: i64 = 366;

/// Max ranges in one ad-hoc reservation.
pub const MAX_RESERVATION_RANGES: usize = 48;

/// Max bookings held per court and date.
pub const MAX_BOOKINGS_PER_DAY: usize = 96;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_PAYMENT_REF_LEN: usize = 512;

/// Widest revenue window, in days.
pub const MAX_REPORT_SPAN_DAYS: i64 = 3660;
