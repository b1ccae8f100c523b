//! speedtest-monitor - internet link quality monitoring across many hosts.
//!
//! # Overview
//!
//! Nodes run a speedtest, classify the result against configured thresholds
//! and send it to a master. The master keeps the latest result per node,
//! derives per-node and fleet-wide status under a staleness timeout, and
//! publishes the aggregated report to Telegram chats on a schedule, on every
//! report, or on request.
//!
//! # API Endpoints (master)
//!
//! - `POST /api/v1/report` - Submit a node measurement
//! - `GET /api/v1/status` - Current aggregated report
//! - `GET /health` - Health check
//!
//! # Modules
//!
//! - [`classify`]: Speed thresholds and tiers
//! - [`store`]: Latest state per node
//! - [`aggregation`]: Status derivation and report building
//! - [`model`]: Measurements, wire payload and report types
//! - [`config`]: YAML configuration and validation
//! - [`api`]: HTTP handlers of the master
//! - [`master`]: Ingestion, scheduler and chat bot
//! - [`render`], [`notifier`], [`telegram`]: Report text and delivery
//! - [`prefs`]: Per-chat preferences in SQLite
//! - [`speedtest`], [`sysinfo`]: Local measurement and host details
//! - [`node`], [`single`]: Node and single mode cycles

pub mod aggregation;
pub mod api;
pub mod classify;
pub mod config;
pub mod master;
pub mod model;
pub mod node;
pub mod notifier;
pub mod prefs;
pub mod render;
pub mod single;
pub mod speedtest;
pub mod store;
pub mod sysinfo;
pub mod telegram;
