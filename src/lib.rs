//! cartella: client core for a patient-records service.
//!
//! Two pieces carry the weight:
//!
//! - the **session manager** ([`session`]): login/logout lifecycle, durable
//!   token storage, and the forced transition to anonymous when the backend
//!   rejects a session with 401;
//! - the **query cache** ([`cache`]): keyed, deduplicating,
//!   stale-while-revalidate reads with prefix invalidation, shared by every
//!   resource service.
//!
//! [`Client`] wires both together with an HTTP transport whose middleware
//! pipeline attaches the bearer token and watches for session loss. See
//! [`patients`] for the typed resource surface.

pub mod cache;
pub mod client;
pub mod config;
pub mod infra;
pub mod patients;
pub mod session;
pub mod transport;
pub(crate) mod util;

pub use cartella_api_types as api_types;
pub use client::{Client, ClientError};
pub use session::{AuthError, Session, SessionPhase};
