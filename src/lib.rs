//! Rategate - Interval-Based Admission Control Proxy
//!
//! This crate implements a reverse proxy that admits requests per URL path
//! at a fixed rate per interval. Denied requests are held until the next
//! interval instead of being rejected. Counting happens either in process
//! with one token bucket per path, or across instances through conditional
//! writes to a shared key-value store such as etcd.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
