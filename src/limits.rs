//! Hard bounds on request payloads and per-provider state.

use crate::model::Ms;

pub const MAX_DURATION_MINUTES: u32 = 8 * 60;
pub const MAX_NOTES_LEN: usize = 1_000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_CURRENCY_LEN: usize = 8;
pub const MAX_ORDER_ID_LEN: usize = 128;
pub const MAX_PAYMENT_KEY_LEN: usize = 128;
pub const MAX_SIGNATURE_LEN: usize = 256;
pub const MAX_WEBHOOK_BODY_BYTES: usize = 64 * 1024;

/// Pending + confirmed slots tracked per provider.
pub const MAX_ACTIVE_SLOTS_PER_PROVIDER: usize = 10_000;

/// 2000-01-01T00:00:00Z .. 2200-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
