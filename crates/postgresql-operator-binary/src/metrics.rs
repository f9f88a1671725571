//! Reconcile counters. Exposition of the registry is left to the hosting
//! process.

use kube::ResourceExt;
use postgresql_operator_crd::UserRole;
use prometheus::{IntCounterVec, Registry, opts};

#[derive(Clone)]
pub struct Metrics {
    reconciliations: IntCounterVec,
    failures: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconciliations = IntCounterVec::new(
            opts!(
                "userrole_reconciliations_total",
                "Reconcile passes started per UserRole"
            ),
            &["name", "namespace"],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "userrole_reconcile_errors_total",
                "Failed reconcile passes per UserRole and error category"
            ),
            &["name", "namespace", "error"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(failures.clone()))?;

        Ok(Self {
            reconciliations,
            failures,
        })
    }

    pub fn count_reconcile(&self, user_role: &UserRole) {
        let name = user_role.name_any();
        let namespace = user_role.namespace().unwrap_or_default();
        self.reconciliations
            .with_label_values(&[name.as_str(), namespace.as_str()])
            .inc();
    }

    pub fn count_failure(&self, user_role: &UserRole, category: &str) {
        let name = user_role.name_any();
        let namespace = user_role.namespace().unwrap_or_default();
        self.failures
            .with_label_values(&[name.as_str(), namespace.as_str(), category])
            .inc();
    }
}
