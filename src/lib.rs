//! refolo: an on-demand revalidation pipeline.
//!
//! A trigger records revalidation requests in a tag-indexed cache-state
//! store and enqueues them on a durable queue. Two independent consumer
//! groups drain every message: one regenerates the artifact and refreshes
//! the cache state, the other derives the CDN path variants and submits a
//! purge to the control plane. Delivery is at-least-once and unordered;
//! correctness rests on idempotent upserts, per-attempt caller references,
//! and receipt-scoped acknowledgment.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;
