//! Portcullis admin - control plane for supervised proxy workers
//!
//! This library provides:
//! - A registry of named services, each a pair of config/handler artifacts
//!   plus a cached running state
//! - Crash-safe persistence of those artifacts in a working directory
//! - Lifecycle control through systemd template units (`portcullis@<name>`)
//! - Startup reconciliation against persisted artifacts and live unit status
//! - A small JSON HTTP API for operators

pub mod api;
pub mod config;
pub mod error;
pub mod registry;
pub mod service;
pub mod storage;
pub mod supervisor;
