//! Tollgate - Distributed Token-Bucket Rate Limiting
//!
//! This crate implements per-tenant, per-endpoint admission control that stays
//! consistent across any number of server processes. Bucket state lives in a
//! single shared Redis instance and every decision is one atomic script
//! execution, so no in-process lock is needed for correctness.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod usage;
