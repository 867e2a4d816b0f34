//! Quotagate - Fixed-Window Request Quotas
//!
//! This crate enforces a per-key request quota over a fixed window and reports
//! the quota state through response headers. The decision engine talks to a
//! pluggable storage backend and is meant to sit in front of application
//! logic as a request interceptor.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod storage;
