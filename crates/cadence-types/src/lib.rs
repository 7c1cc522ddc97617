pub mod attestation;
pub mod error;
pub mod event;
pub mod plan;
pub mod policy;
pub mod route;
pub mod sandbox;

pub use attestation::*;
pub use error::*;
pub use event::*;
pub use plan::*;
pub use policy::*;
pub use route::*;
pub use sandbox::*;

/// Capability strings are lowercased dotted tokens.
pub const CAPABILITY_PATTERN: &str = r"^[a-z0-9_.-]+$";

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
