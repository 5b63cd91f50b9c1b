//! Job manager control plane library.
//!
//! The crate ships the `job-manager` binary; the library surface exists so
//! integration tests can drive the service, controllers and stores directly.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod db;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod workload;
