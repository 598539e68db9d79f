//! Turnstile - Request Admission Control
//!
//! This crate implements per-identity token-bucket rate limiting for an API
//! service. Buckets are cached per identity, shared per (rate, burst)
//! configuration through an explicit [`LimiterRegistry`](ratelimit::LimiterRegistry),
//! and evicted by background sweepers once idle.

pub mod config;
pub mod error;
pub mod ratelimit;
