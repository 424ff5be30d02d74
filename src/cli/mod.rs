pub mod config;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::Api;
use kube::runtime::Elector;
use kube::CustomResourceExt;
use tracing::info;

use crate::controllers;
use crate::crd::{Task, Workflow};
use config::OperatorConfig;

#[derive(Parser)]
#[command(name = "mcall", version, about = "Kubernetes-native task and workflow orchestration operator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the operator reconcilers
    Run {
        /// Acquire a leader lease before reconciling; standby otherwise
        #[arg(long)]
        leader_elect: bool,

        /// Lease name used for leader election
        #[arg(long, default_value = "mcall-operator")]
        lease_name: String,

        /// Lease namespace (defaults to the client's default namespace)
        #[arg(long)]
        lease_namespace: Option<String>,

        /// Holder identity (defaults to $HOSTNAME)
        #[arg(long)]
        instance: Option<String>,

        /// Lease duration in seconds
        #[arg(long, default_value_t = 15)]
        lease_duration_secs: i32,
    },

    /// Print the Task and Workflow CRD manifests
    Crd,
}

pub async fn run_cli() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            print!("{}", serde_yml::to_string(&Task::crd())?);
            println!("---");
            print!("{}", serde_yml::to_string(&Workflow::crd())?);
            Ok(())
        }
        Commands::Run {
            leader_elect,
            lease_name,
            lease_namespace,
            instance,
            lease_duration_secs,
        } => {
            let config = OperatorConfig::from_env()?;
            let client = kube::Client::try_default()
                .await
                .context("connecting to the cluster")?;
            info!(
                reconcile_interval_s = config.reconcile_interval.as_secs(),
                task_timeout_s = config.task_timeout.as_secs(),
                "operator configuration loaded"
            );

            if leader_elect {
                let leases: Api<Lease> = match lease_namespace {
                    Some(ns) => Api::namespaced(client.clone(), &ns),
                    None => Api::default_namespaced(client.clone()),
                };
                let instance = instance
                    .or_else(|| std::env::var("HOSTNAME").ok())
                    .unwrap_or_else(|| "mcall-operator".to_string());
                info!(lease = %lease_name, instance = %instance, "acquiring leader lease");
                let elector = Elector::new(leases, &lease_name, &instance, lease_duration_secs);
                elector.run(controllers::run(client, config)).await??;
            } else {
                controllers::run(client, config).await?;
            }
            Ok(())
        }
    }
}
