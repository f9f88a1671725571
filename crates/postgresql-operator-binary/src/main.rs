use std::{sync::Arc, time::Duration};

use clap::Parser;
use kube::{Client, CustomResourceExt};
use kube::runtime::events::Reporter;
use postgresql_operator::{
    controller::{self, CONTROLLER_NAME, Ctx},
    metrics::Metrics,
    pg::postgres::PgEngineFactory,
    resolve::KubeResourceFetcher,
    secret_store::KubeSecretStore,
};
use postgresql_operator_crd::UserRole;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "postgresql-operator",
    author,
    version,
    about = "Manages PostgreSQL login roles, their privileges and connection secrets"
)]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Print the UserRole CRD
    Crd,
    /// Run the operator
    Run(RunArgs),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Wall-clock budget of a single reconcile pass
    #[arg(long, env = "RECONCILE_TIMEOUT", default_value = "2m", value_parser = humantime::parse_duration)]
    reconcile_timeout: Duration,

    /// How soon a converged object is reconciled again when no rotation is
    /// pending
    #[arg(long, env = "REQUEUE_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    requeue_interval: Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Opts::parse().command {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&UserRole::crd())?);
        }
        Command::Run(args) => run(args).await?,
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = Client::try_default().await?;
    let registry = prometheus::Registry::new();

    let ctx = Arc::new(Ctx {
        secrets: KubeSecretStore::new(client.clone()),
        fetcher: KubeResourceFetcher::new(client.clone()),
        engine_factory: PgEngineFactory::new(client.clone()),
        metrics: Metrics::new(&registry)?,
        reporter: Reporter {
            controller: CONTROLLER_NAME.to_owned(),
            instance: None,
        },
        reconcile_timeout: args.reconcile_timeout,
        requeue_interval: args.requeue_interval,
        client,
    });

    controller::run(ctx).await;
    Ok(())
}
