use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_COURSES_PER_TENANT: usize = 100_000;
pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_PHONE_LEN: usize = 15;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A reservation can cover at most a (leap) year, e.g. a whole-semester booking.
pub const MAX_RESERVATION_SPAN_MS: Ms = 366 * 24 * 3_600_000;

/// Attempts at re-locking when a record moved between lookup and lock.
pub const MAX_LOCK_RETRIES: usize = 3;
