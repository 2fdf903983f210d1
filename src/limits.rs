//! Hard caps enforced at the engine boundary.

use crate::model::Minutes;

pub const MAX_RESTAURANTS: usize = 1024;
pub const MAX_RESTAURANT_ID_LEN: usize = 128;

pub const MAX_TABLES_PER_RESTAURANT: usize = 1024;
pub const MAX_RESERVATIONS_PER_TABLE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_COMMENT_LEN: usize = 2048;
pub const MAX_SOURCE_LEN: usize = 64;

pub const MAX_PARTY_SIZE: u32 = 500;
pub const MAX_RESULTS: usize = 200;

/// Finer grids than this make the candidate scan needlessly large.
pub const MIN_SLOT_INTERVAL: Minutes = 5;
pub const MAX_DURATION: Minutes = 24 * 60;
