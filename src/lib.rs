//! # jobtrail
//!
//! Lifecycle audit pipeline for asynchronously executed automation jobs.
//!
//! Running jobs report lifecycle events to an [`sink::EventSink`], which
//! logs them and forwards them to the Postgres-backed [`audit::AuditWriter`].
//! Raw producer results are reduced to one canonical envelope by
//! [`normalize::Normalizer`].

pub mod audit;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod normalize;
pub mod sink;
pub mod telemetry;
