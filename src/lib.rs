//! forgeflow - incremental source-forge crawler
//!
//! Crawls GitHub and GitLab repositories per tenant, persists merge
//! requests, commit ancestry, deployments and members into per-tenant
//! SQLite databases, then correlates deployments with merge requests over
//! the commit DAG to derive delivery metrics.

pub mod activities;
pub mod config;
pub mod correlate;
pub mod error;
pub mod extract;
pub mod forge;
pub mod ledger;
pub mod models;
pub mod schedule;
pub mod store;
pub mod transform;
pub mod workflow;
