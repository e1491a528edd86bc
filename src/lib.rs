//! Personal telemetry agent for Hyundai/Kia Bluelink EVs.
//!
//! Polls the vendor cloud under a hard daily quota, normalizes each
//! response into a domain model, persists battery / trip / location /
//! charging-session time series, and serves a small dashboard API.

pub mod api;
pub mod cache;
pub mod charging;
pub mod client;
pub mod collector;
pub mod config;
pub mod domain;
pub mod freshness;
pub mod governor;
pub mod storage;
pub mod telemetry;
pub mod vendor;
pub mod weather;
