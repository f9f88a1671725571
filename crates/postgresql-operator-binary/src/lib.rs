//! Reconciliation subsystem of the postgresql-operator.
//!
//! The kube-facing pieces live in [`controller`]; everything below it runs
//! against the [`pg::PgEngine`], [`secret_store::SecretStore`] and
//! [`resolve::ResourceFetcher`] seams so reconcile passes can be exercised
//! without a cluster.

pub mod controller;
pub mod events;
#[cfg(test)]
pub(crate) mod fakes;
pub mod metrics;
pub mod output_secret;
pub mod pass;
pub mod pg;
pub mod privileges;
pub mod reaper;
pub mod resolve;
pub mod role_sync;
pub mod secret_store;
pub mod validation;
pub mod work_secret;
