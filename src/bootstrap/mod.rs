//! Cluster bootstrap
//!
//! Boot runs as named stages. Every task of a stage runs concurrently and
//! the next stage starts only when all of them succeeded:
//!
//! 1. `prepare`: `forward_http`, `ensure_https_certificates`,
//!    `ensure_docker_tls_certificates`, `verify_authority_access`
//! 2. `register`: `register_docker_client`
//!
//! The first failing task aborts boot with a [`BootError`] naming it; the
//! front door is only started after a successful boot.

pub mod docker_tls;
pub mod forward;
pub mod https;
pub mod registration;

pub use docker_tls::{
    ensure_docker_tls_certificates, SERVER_CA_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE,
};
pub use forward::{forward_http, forwarder_response};
pub use https::ensure_https_certificates;
pub use registration::{register_docker_client, verify_authority_access};

use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

use crate::auth::OAuth2Client;
use crate::config::{Args, SettingsStore};
use crate::tls::{ChallengeStore, RSA_KEY_BITS};
use crate::types::{GatewayError, Result};

/// Everything boot tasks need
pub struct BootContext {
    pub args: Args,
    pub settings: Arc<SettingsStore>,
    pub oauth2: Arc<OAuth2Client>,
    /// Shared with the HTTP forwarder, which serves the pending challenges
    pub challenges: ChallengeStore,
    /// RSA modulus size for generated keys
    pub key_bits: usize,
}

impl BootContext {
    pub fn new(args: Args, settings: Arc<SettingsStore>, oauth2: Arc<OAuth2Client>) -> Self {
        Self {
            args,
            settings,
            oauth2,
            challenges: ChallengeStore::new(),
            key_bits: RSA_KEY_BITS,
        }
    }
}

/// A boot task failed; boot does not continue past its stage
#[derive(Debug, Error)]
#[error("boot stage '{stage}' failed in task '{task}': {source}")]
pub struct BootError {
    pub stage: &'static str,
    pub task: &'static str,
    #[source]
    pub source: GatewayError,
}

/// A named unit of boot work
pub struct BootTask<'a> {
    pub name: &'static str,
    pub run: BoxFuture<'a, Result<()>>,
}

impl<'a> BootTask<'a> {
    pub fn new(
        name: &'static str,
        run: impl std::future::Future<Output = Result<()>> + Send + 'a,
    ) -> Self {
        Self {
            name,
            run: run.boxed(),
        }
    }
}

/// Run all tasks concurrently; fails with the first task error
pub async fn run_stage(
    stage: &'static str,
    tasks: Vec<BootTask<'_>>,
) -> std::result::Result<(), BootError> {
    let started = Instant::now();
    let names: Vec<&str> = tasks.iter().map(|t| t.name).collect();
    info!(stage, tasks = ?names, "Boot stage starting");

    try_join_all(tasks.into_iter().map(|task| async move {
        let task_started = Instant::now();
        match task.run.await {
            Ok(()) => {
                info!(
                    stage,
                    task = task.name,
                    elapsed_ms = task_started.elapsed().as_millis() as u64,
                    "Boot task complete"
                );
                Ok(())
            }
            Err(source) => {
                error!(stage, task = task.name, error = %source, "Boot task failed");
                Err(BootError {
                    stage,
                    task: task.name,
                    source,
                })
            }
        }
    }))
    .await?;

    info!(stage, elapsed_ms = started.elapsed().as_millis() as u64, "Boot stage complete");
    Ok(())
}

/// Run the full boot sequence
pub async fn run(ctx: &BootContext) -> std::result::Result<(), BootError> {
    run_stage(
        "prepare",
        vec![
            BootTask::new("forward_http", forward_http(ctx)),
            BootTask::new("ensure_https_certificates", ensure_https_certificates(ctx)),
            BootTask::new("ensure_docker_tls_certificates", ensure_docker_tls_certificates(ctx)),
            BootTask::new("verify_authority_access", verify_authority_access(ctx)),
        ],
    )
    .await?;

    run_stage(
        "register",
        vec![BootTask::new("register_docker_client", register_docker_client(ctx))],
    )
    .await
}
