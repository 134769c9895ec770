//! Hard limits that protect the in-memory store from unbounded input.

pub const MAX_LOCATIONS: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_IMG_LEN: usize = 1024;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SETTING_VALUE_LEN: usize = 256;

/// A 9:00–21:00 day holds at most 12 one-hour bookings; leave headroom for
/// legacy rows replayed from older logs.
pub const MAX_BOOKINGS_PER_DAY: usize = 32;

/// Upper bound on `cooldown_days`.
pub const MAX_COOLDOWN_DAYS: u32 = 365;
