//! Hard caps. Violations surface as `EngineError::LimitExceeded` with the
//! human-readable name of the limit.

/// Slots per booking request.
pub const MAX_BATCH_SLOTS: usize = 32;

/// Hours in one prepaid package.
pub const MAX_PACKAGE_HOURS: i64 = 100;

/// Manual windows per (expert, date).
pub const MAX_WINDOWS_PER_DAY: usize = 16;

/// Sessions held per expert before inserts are refused.
pub const MAX_SESSIONS_PER_EXPERT: usize = 100_000;

/// Experts per tenant.
pub const MAX_EXPERTS_PER_TENANT: usize = 10_000;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_TEXT_LEN: usize = 2_000;

/// Logical databases one process will host.
pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 64;

/// Minute-of-day bounds for any window or slot endpoint.
pub const MAX_MINUTE: crate::model::Minute = 24 * 60;
