//! The kube-facing reconciler: finalizer handling, deadline enforcement,
//! status patching, event publication and error accounting.

use std::{error::Error as StdError, sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{Event as FinalizerEvent, finalizer},
        watcher,
    },
};
use postgresql_operator_crd::{USER_ROLE_FINALIZER, UserRole, UserRolePhase, UserRoleStatus};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{info, instrument, warn};

use crate::{
    events::{EventReason, EventSeverity, PassEvent},
    metrics::Metrics,
    pass::{self, PassDeps, PassOutcome},
    pg::postgres::PgEngineFactory,
    resolve::KubeResourceFetcher,
    secret_store::KubeSecretStore,
};

pub const CONTROLLER_NAME: &str = "postgresql-operator";

/// Requeue after collaborators that are not ready yet.
const AWAIT_DEPENDENCY_REQUEUE: Duration = Duration::from_secs(5);

pub struct Ctx {
    pub client: Client,
    pub secrets: KubeSecretStore,
    pub fetcher: KubeResourceFetcher,
    pub engine_factory: PgEngineFactory,
    pub metrics: Metrics,
    pub reporter: Reporter,
    pub reconcile_timeout: Duration,
    pub requeue_interval: Duration,
}

#[derive(Debug, EnumDiscriminants, Snafu)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    MissingNamespace,

    #[snafu(display("reconcile pass failed"))]
    Pass { source: pass::Error },

    #[snafu(display("reconcile pass exceeded its deadline of {timeout:?}"))]
    Deadline { timeout: Duration },

    #[snafu(display("failed to patch UserRole status"))]
    PatchStatus { source: kube::Error },

    #[snafu(display("failed to record the work secret name in the spec"))]
    PatchSpec { source: kube::Error },

    #[snafu(display("rotation is blocked: role {role} is still queued for deletion"))]
    RotationBlocked { role: String },

    #[snafu(display("deletion is blocked: {roles:?} still have to be reaped"))]
    DeletionBlocked { roles: Vec<String> },

    #[snafu(display("finalizer handling failed"))]
    Finalizer {
        source: Box<kube::runtime::finalizer::Error<Error>>,
    },
}

impl Error {
    /// Stable category string for events and the failure counter.
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[instrument(skip(ctx, user_role), fields(name = %user_role.name_any(), namespace = tracing::field::Empty))]
pub async fn reconcile(user_role: Arc<UserRole>, ctx: Arc<Ctx>) -> Result<Action> {
    let namespace = user_role.namespace().context(MissingNamespaceSnafu)?;
    tracing::Span::current().record("namespace", namespace.as_str());

    let api: Api<UserRole> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, USER_ROLE_FINALIZER, user_role, |event| async {
        match event {
            FinalizerEvent::Apply(user_role) => apply(user_role, ctx.clone()).await,
            FinalizerEvent::Cleanup(user_role) => cleanup(user_role, ctx.clone()).await,
        }
    })
    .await
    .map_err(|source| Error::Finalizer {
        source: Box::new(source),
    })
}

pub fn error_policy(_user_role: Arc<UserRole>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(
        error = error as &dyn StdError,
        category = error.category(),
        "reconcile failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn apply(user_role: Arc<UserRole>, ctx: Arc<Ctx>) -> Result<Action> {
    ctx.metrics.count_reconcile(&user_role);

    let user_role = ensure_work_secret_name(user_role, &ctx).await?;
    let deps = PassDeps {
        fetcher: &ctx.fetcher,
        secrets: &ctx.secrets,
        engines: &ctx.engine_factory,
    };

    let outcome = match tokio::time::timeout(
        ctx.reconcile_timeout,
        pass::run_pass(&deps, &user_role, Utc::now()),
    )
    .await
    {
        Err(_elapsed) => DeadlineSnafu {
            timeout: ctx.reconcile_timeout,
        }
        .fail(),
        Ok(result) => result.context(PassSnafu),
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(error) => {
            record_failure(&ctx, &user_role, &error).await;
            return Err(error);
        }
    };

    match outcome {
        PassOutcome::AwaitDatabase { namespace, name } => {
            info!(
                database = format!("{namespace}/{name}"),
                "waiting for database to become ready"
            );
            publish_events(
                &ctx,
                &user_role,
                &[PassEvent {
                    severity: EventSeverity::Normal,
                    reason: EventReason::Processing,
                    action: "Reconcile",
                    message: format!("waiting for database {namespace}/{name} to become ready"),
                }],
            )
            .await;
            Ok(Action::requeue(AWAIT_DEPENDENCY_REQUEUE))
        }
        PassOutcome::Converged(report) => {
            patch_status(&ctx, &user_role, &report.status).await?;
            publish_events(&ctx, &user_role, &report.events).await;

            if let Some(role) = report.blocked_rotation {
                let error = RotationBlockedSnafu { role }.build();
                ctx.metrics.count_failure(&user_role, error.category());
                return Err(error);
            }

            Ok(Action::requeue(
                report.requeue_after.unwrap_or(ctx.requeue_interval),
            ))
        }
    }
}

async fn cleanup(user_role: Arc<UserRole>, ctx: Arc<Ctx>) -> Result<Action> {
    let deps = PassDeps {
        fetcher: &ctx.fetcher,
        secrets: &ctx.secrets,
        engines: &ctx.engine_factory,
    };

    let report = pass::run_deletion(&deps, &user_role)
        .await
        .context(PassSnafu)?;
    publish_events(&ctx, &user_role, &report.events).await;

    if !report.remaining.is_empty() {
        // The finalizer stays until every queued role is gone.
        let mut status = user_role.status_or_default();
        status.old_postgres_roles = report.remaining.clone();
        patch_status(&ctx, &user_role, &status).await?;

        let error = DeletionBlockedSnafu {
            roles: report.remaining,
        }
        .build();
        ctx.metrics.count_failure(&user_role, error.category());
        return Err(error);
    }

    Ok(Action::await_change())
}

/// Fills `workGeneratedSecretName` on the first pass; the name is stable for
/// the lifetime of the object afterwards.
async fn ensure_work_secret_name(
    user_role: Arc<UserRole>,
    ctx: &Ctx,
) -> Result<Arc<UserRole>> {
    if user_role.work_secret_name().is_some() {
        return Ok(user_role);
    }

    let namespace = user_role.namespace().context(MissingNamespaceSnafu)?;
    let name = user_role.default_work_secret_name();

    let api: Api<UserRole> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch(
        &user_role.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"workGeneratedSecretName": name}})),
    )
    .await
    .context(PatchSpecSnafu)?;

    let mut updated = (*user_role).clone();
    updated.spec.work_generated_secret_name = Some(name);
    Ok(Arc::new(updated))
}

async fn patch_status(ctx: &Ctx, user_role: &UserRole, status: &UserRoleStatus) -> Result<()> {
    if user_role.status.as_ref() == Some(status) {
        return Ok(());
    }

    let namespace = user_role.namespace().context(MissingNamespaceSnafu)?;
    let api: Api<UserRole> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &user_role.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({"status": status})),
    )
    .await
    .context(PatchStatusSnafu)?;
    Ok(())
}

/// Patches the failure into the status and accounts for it. Only the phase
/// fields change; the rest of the status keeps its last coherent values.
async fn record_failure(ctx: &Ctx, user_role: &UserRole, error: &Error) {
    ctx.metrics.count_failure(user_role, error.category());

    let mut status = user_role.status_or_default();
    status.phase = UserRolePhase::Failed;
    status.ready = false;
    status.message = error_chain(error);

    if let Err(patch_error) = patch_status(ctx, user_role, &status).await {
        warn!(
            error = &patch_error as &dyn StdError,
            "failed to record reconcile failure in status"
        );
    }

    publish_events(
        ctx,
        user_role,
        &[PassEvent {
            severity: EventSeverity::Warning,
            reason: EventReason::ProcessingError,
            action: "Reconcile",
            message: status.message.clone(),
        }],
    )
    .await;
}

async fn publish_events(ctx: &Ctx, user_role: &UserRole, events: &[PassEvent]) {
    if events.is_empty() {
        return;
    }

    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let object_ref = user_role.object_ref(&());
    for event in events {
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let result = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.to_string(),
                    note: Some(event.message.clone()),
                    action: event.action.to_owned(),
                    secondary: None,
                },
                &object_ref,
            )
            .await;
        if let Err(error) = result {
            warn!(
                error = &error as &dyn StdError,
                "failed to publish Kubernetes event"
            );
        }
    }
}

/// Walks the error chain into one message, the way events report it.
fn error_chain(error: &Error) -> String {
    use std::fmt::Write;

    let mut message = error.to_string();
    let mut source: &dyn StdError = error;
    while let Some(next) = source.source() {
        // Infallible for String
        let _ = write!(message, ": {next}");
        source = next;
    }
    message
}

/// Wires up and runs the controller until shutdown.
pub async fn run(ctx: Arc<Ctx>) {
    let user_roles = Api::<UserRole>::all(ctx.client.clone());
    let secrets = Api::<Secret>::all(ctx.client.clone());

    Controller::new(user_roles, watcher::Config::default())
        .owns(secrets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _action)) => {
                    info!(object = %object, "reconciled");
                }
                Err(error) => {
                    warn!(error = &error as &dyn StdError, "reconciliation failed");
                }
            }
        })
        .await;
}
