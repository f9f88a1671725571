//! Drops superseded login roles without disrupting live sessions.
//!
//! A role is only dropped after its owned objects have been reassigned to
//! the database owner. Roles with an active session stay queued and are
//! retried on the next pass.

use std::collections::BTreeSet;

use snafu::Snafu;

use crate::{
    pg,
    resolve::ResolvedDependencies,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to reap role {role} on engine {engine}"))]
    Engine {
        source: pg::Error,
        role: String,
        engine: String,
    },
}

#[derive(Debug, Default)]
pub struct ReapReport {
    /// Roles still queued for deletion, deduplicated.
    pub remaining: Vec<String>,

    /// Roles dropped from at least one engine this pass.
    pub dropped: Vec<String>,

    /// `(role, engine)` pairs deferred because of an active session.
    pub deferred: Vec<(String, String)>,
}

/// Attempts to drop every queued role on every engine.
pub async fn reap_roles(
    resolved: &ResolvedDependencies,
    old_roles: &[String],
) -> Result<ReapReport, Error> {
    let queue: BTreeSet<&str> = old_roles.iter().map(String::as_str).collect();

    let mut report = ReapReport::default();
    let mut remaining = BTreeSet::new();

    for role in queue {
        let mut kept = false;
        let mut dropped_somewhere = false;

        for (engine_key, engine) in &resolved.engines {
            let context = |source| Error::Engine {
                source,
                role: role.to_owned(),
                engine: engine_key.clone(),
            };

            if !engine.role_exists(role).await.map_err(context)? {
                continue;
            }

            if engine.has_active_session(role).await.map_err(context)? {
                kept = true;
                report.deferred.push((role.to_owned(), engine_key.clone()));
                continue;
            }

            // Membership in the doomed role gives the operator the rights
            // over its owned objects.
            engine
                .grant_role(role, engine.current_user(), false)
                .await
                .map_err(context)?;

            for binding in resolved.privilege_groups.get(engine_key).into_iter().flatten() {
                let status = binding.database.status.clone().unwrap_or_default();
                if status.database.is_empty() || status.roles.owner.is_empty() {
                    continue;
                }
                engine
                    .reassign_owned_and_drop(role, &status.roles.owner, &status.database)
                    .await
                    .map_err(context)?;
            }

            engine.drop_role(role).await.map_err(context)?;
            dropped_somewhere = true;
        }

        if kept {
            remaining.insert(role.to_owned());
        } else if dropped_somewhere {
            report.dropped.push(role.to_owned());
        }
    }

    report.remaining = remaining.into_iter().collect();
    Ok(report)
}
