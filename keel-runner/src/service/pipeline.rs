//! Job pipeline
//!
//! Drives one decoded job from `pending` to a terminal status:
//! 1. wait for the previous job, if any
//! 2. mark the job running
//! 3. start the SSH agent and load the job's keys
//! 4. create the scratch directories and build the command plan
//! 5. build the environment and materialize the cloud credential
//! 6. run the pre-steps and the main step, then the teardown steps
//! 7. record the terminal status
//!
//! The agent, the scratch directories and the credential file are released on
//! every path out of the pipeline.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::{JobContext, JobPaths};
use crate::family::{JobFamily, Step};
use crate::repository::DocumentStore;
use crate::secret::SecretCodec;
use crate::service::agent::{AgentService, AgentSession};
use crate::service::cancel::CancelWatcher;
use crate::service::credentials::{CloudMaterial, CredentialMaterializer};
use crate::service::dependency::{DependencyOutcome, DependencyWaiter};
use crate::service::process::{self, ProcessOutcome};
use crate::service::state::JobStateMachine;
use keel_core::domain::job::JobStatus;

/// How a run ended, before it is written
#[derive(Debug, PartialEq, Eq)]
enum Finish {
    Success,
    Failed(String),
    Cancelled,
}

/// Resources held by a running job
#[derive(Default)]
struct JobResources {
    agent: Option<Box<dyn AgentSession>>,
    paths: Option<JobPaths>,
    cloud: Option<CloudMaterial>,
}

impl JobResources {
    fn cleanup(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            agent.cleanup();
        }
        if let Some(mut cloud) = self.cloud.take() {
            cloud.cleanup();
        }
        if let Some(mut paths) = self.paths.take() {
            paths.cleanup();
        }
    }
}

impl Drop for JobResources {
    fn drop(&mut self) {
        self.cleanup();
    }
}

pub struct JobPipeline<F: JobFamily> {
    family: F,
    config: Config,
    codec: SecretCodec,
    state: JobStateMachine,
    waiter: DependencyWaiter,
    agents: Arc<dyn AgentService>,
}

impl<F: JobFamily> JobPipeline<F> {
    pub fn new(
        family: F,
        config: Config,
        codec: SecretCodec,
        store: Arc<dyn DocumentStore>,
        agents: Arc<dyn AgentService>,
    ) -> Self {
        let state = JobStateMachine::new(
            Arc::clone(&store),
            family.name(),
            family.jobs_collection(),
            family.templates_collection(),
        );
        let waiter = DependencyWaiter::new(
            store,
            config.dependency_poll_interval,
            config.dependency_timeout,
        );

        Self {
            family,
            config,
            codec,
            state,
            waiter,
            agents,
        }
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    pub fn state(&self) -> &JobStateMachine {
        &self.state
    }

    /// Runs a job that was already marked pending
    pub async fn run(&self, ctx: &mut JobContext<F::Options>) {
        let _watcher = CancelWatcher::spawn(
            Arc::clone(self.state.store()),
            self.state.jobs_collection(),
            ctx.job.id,
            self.config.cancel_poll_interval,
            ctx.cancel.clone(),
        );

        if let Some(previous) = ctx.previous_job.clone() {
            self.state.transition(&mut ctx.job, JobStatus::Waiting).await;

            match self.waiter.wait(&previous, &ctx.cancel).await {
                DependencyOutcome::Ready => {}
                DependencyOutcome::Failed(explanation) | DependencyOutcome::TimedOut(explanation) => {
                    self.state.error(&mut ctx.job, explanation).await;
                    return;
                }
                DependencyOutcome::Cancelled => {
                    self.state.cancel(&mut ctx.job).await;
                    return;
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            self.state.cancel(&mut ctx.job).await;
            return;
        }

        self.state.transition(&mut ctx.job, JobStatus::Running).await;

        let mut resources = JobResources::default();
        let finish = self.execute(ctx, &mut resources).await;
        resources.cleanup();

        match finish {
            Finish::Success => self.state.succeed(&mut ctx.job).await,
            Finish::Failed(_) | Finish::Cancelled if ctx.cancel.is_cancelled() => {
                self.state.cancel(&mut ctx.job).await
            }
            Finish::Failed(explanation) => self.state.fail(&mut ctx.job, explanation).await,
            Finish::Cancelled => self.state.cancel(&mut ctx.job).await,
        }
    }

    async fn execute(&self, ctx: &mut JobContext<F::Options>, resources: &mut JobResources) -> Finish {
        let session = match self.agents.start().await {
            Ok(session) => resources.agent.insert(session),
            Err(e) => {
                error!("Job {}: {}", ctx.job.id, e);
                return Finish::Failed(e.to_string());
            }
        };

        for credential in self.family.agent_credentials(ctx) {
            let secrets = self
                .codec
                .decrypt(&credential.ssh_key_data)
                .and_then(|key| Ok((key, self.codec.decrypt(&credential.ssh_key_unlock)?)));
            let (key, unlock) = match secrets {
                Ok(secrets) => secrets,
                Err(e) => {
                    error!("Job {}: credential {}: {}", ctx.job.id, credential.id, e);
                    return Finish::Failed(e.to_string());
                }
            };

            let passphrase = Some(unlock.expose()).filter(|p| !p.is_empty());
            if let Err(e) = session.add_key(key.expose(), passphrase).await {
                error!("Job {}: unable to load key of credential {}: {}", ctx.job.id, credential.id, e);
                return Finish::Failed(e.to_string());
            }
            debug!("Loaded key of credential {} into the agent", credential.id);
        }
        let agent = session.info().clone();

        let paths = match JobPaths::create(&self.config.tmp_path) {
            Ok(paths) => resources.paths.insert(paths),
            Err(e) => return Finish::Failed(format!("unable to create job directories: {}", e)),
        };

        let mut plan = match self.family.build_command(ctx, paths) {
            Ok(plan) => plan,
            Err(e) => return Finish::Failed(e.to_string()),
        };
        if self.config.proot_enabled {
            let project_root = ctx.project_root(&self.config.projects_home);
            plan = process::sandbox(plan, paths, &self.config, &project_root);
        }

        let (mut env, audit) = self.family.build_environment(ctx, &agent);

        let cloud = if self.family.uses_cloud_credential(ctx) {
            ctx.cloud_credential()
        } else {
            None
        };
        if let Some(credential) = cloud {
            let materializer = CredentialMaterializer::new(self.codec.clone(), &paths.credentials);
            match materializer.materialize(credential) {
                Ok(material) => env.extend(resources.cloud.insert(material).env.clone()),
                Err(e) => return Finish::Failed(e.to_string()),
            }
        }

        ctx.job.job_args = plan.main.audit_args();
        ctx.job.job_env = audit.to_assignments();
        ctx.job.job_cwd = plan.working_dir.display().to_string();

        let timeout = self.family.timeout(ctx);
        info!(
            "Job {} running {:?} in {}",
            ctx.job.id, ctx.job.job_args, ctx.job.job_cwd
        );

        let mut finish = None;
        for step in &plan.pre_steps {
            if let Some(failed) = self.run_pre_step(ctx, step, &env, &plan.working_dir, timeout).await {
                finish = Some(failed);
                break;
            }
        }

        let finish = match finish {
            Some(finish) => finish,
            None => {
                match process::run_step(&plan.main, &env, &plan.working_dir, timeout, &ctx.cancel).await {
                    Ok(output) => {
                        let finish = match output.outcome {
                            ProcessOutcome::Cancelled => Finish::Cancelled,
                            _ => match output.explanation() {
                                None => Finish::Success,
                                Some(explanation) => Finish::Failed(explanation),
                            },
                        };
                        ctx.job.result_stdout = output.stdout;
                        finish
                    }
                    Err(e) => Finish::Failed(e.to_string()),
                }
            }
        };

        // teardown runs even for cancelled jobs
        let teardown_cancel = CancellationToken::new();
        for step in &plan.teardown {
            match process::run_step(step, &env, &plan.working_dir, timeout, &teardown_cancel).await {
                Ok(output) if !output.success() => {
                    warn!("Teardown step {} failed: {:?}", step.program, output.explanation())
                }
                Ok(_) => {}
                Err(e) => warn!("Teardown step {} failed: {}", step.program, e),
            }
        }

        finish
    }

    /// Runs one pre-step, returning how the job ends if it must stop here
    async fn run_pre_step(
        &self,
        ctx: &mut JobContext<F::Options>,
        step: &Step,
        env: &crate::family::Environment,
        cwd: &std::path::Path,
        timeout: std::time::Duration,
    ) -> Option<Finish> {
        match process::run_step(step, env, cwd, timeout, &ctx.cancel).await {
            Ok(output) if output.outcome == ProcessOutcome::Cancelled => Some(Finish::Cancelled),
            Ok(output) if output.success() => None,
            Ok(output) => {
                let explanation = step
                    .failure_explanation
                    .clone()
                    .or_else(|| output.explanation())
                    .unwrap_or_default();

                if !step.fatal {
                    warn!("Job {}: {} failed: {}", ctx.job.id, step.program, explanation);
                    return None;
                }
                ctx.job.result_stdout = output.stdout;
                Some(Finish::Failed(explanation))
            }
            Err(e) if !step.fatal => {
                warn!("Job {}: {}", ctx.job.id, e);
                None
            }
            Err(e) => Some(Finish::Failed(
                step.failure_explanation.clone().unwrap_or_else(|| e.to_string()),
            )),
        }
    }
}
