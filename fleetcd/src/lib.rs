//! fleetcd: GitOps reconciliation of Omni machine classes and cluster templates.
//!
//! The [`controller::Controller`] drives cycles; the [`reconciler::Reconciler`]
//! converges live state against the source checkout and records every outcome
//! in the [`store::StateStore`], which observers read through snapshots.

pub mod audit;
pub mod catalog;
pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod oracle;
pub mod reconciler;
pub mod resource;
pub mod store;
pub mod template;

pub use controller::{ConnectivityPolicy, Controller, ControllerConfig, TriggerOutcome};
pub use store::{Snapshot, StateStore, StoreConfig};
