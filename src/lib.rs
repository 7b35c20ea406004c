//! mapflat: batch migration of time-series metric records from a
//! dynamic map-column schema into a flattened, pre-aggregated
//! fixed-column schema.
//!
//! The pipeline runs in four phases over a bounded time window:
//! key discovery, schema creation, chunked transformation, and
//! validation. Each phase persists its state as a durable artifact so
//! interrupted runs resume where they left off.

pub mod catalog;
pub mod chunks;
pub mod config;
pub mod discover;
pub mod engine;
pub mod model;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod validate;
