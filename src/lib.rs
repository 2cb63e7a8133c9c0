pub mod auth;
pub mod clock;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod sql;
pub mod tenant;
pub mod timeutil;
pub mod tls;
pub mod validate;
pub mod wal;
pub mod wire;
