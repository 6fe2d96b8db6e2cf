//! Playbook job family
//!
//! Drives `ansible-playbook` for regular and check runs. Project update jobs
//! arrive on the same queue and are delegated to [`super::sync`].

use keel_core::domain::ansible::{PlaybookJobType, PlaybookOptions};
use keel_core::domain::collection::Collection;
use keel_core::domain::credential::{Credential, CredentialKind};
use serde_json::{Value as JsonValue, json};
use std::path::PathBuf;
use std::time::Duration;

use super::{
    CommandPlan, Environment, FamilyError, JobFamily, Step, base_environment, machine_and_network,
    set_token, sync,
};
use crate::config::Config;
use crate::context::{JobContext, JobPaths};
use crate::secret::SecretCodec;
use crate::service::agent::AgentInfo;

pub struct AnsibleFamily {
    config: Config,
    codec: SecretCodec,
}

impl AnsibleFamily {
    pub fn new(config: Config, codec: SecretCodec) -> Self {
        Self { config, codec }
    }

    fn inventory_plugin(&self) -> String {
        self.config
            .data_dir
            .join("plugins/inventory/keelrest.py")
            .display()
            .to_string()
    }

    /// Flags derived from the job options, in the order ansible documents them
    fn playbook_params(step: Step, options: &PlaybookOptions) -> Step {
        let mut step = step;

        if options.job_type == PlaybookJobType::Check {
            step = step.arg("--check");
        }
        if options.forks != 0 {
            step = step.arg("-f").arg(options.forks.to_string());
        }
        if !options.limit.is_empty() {
            step = step.arg("-l").arg(&options.limit);
        }
        if let Some(flag) = options.verbosity_flag() {
            step = step.arg(flag);
        }
        if !options.extra_vars.is_empty() {
            let vars = JsonValue::Object(options.extra_vars.clone());
            step = step.arg("-e").arg(vars.to_string());
        }
        if !options.job_tags.is_empty() {
            step = step.arg("-t").arg(&options.job_tags);
        }
        if !options.skip_tags.is_empty() {
            step = step.arg(format!("--skip-tags={}", options.skip_tags));
        }
        if options.force_handlers {
            step = step.arg("--force-handlers");
        }
        if !options.start_at_task.is_empty() {
            step = step.arg(format!("--start-at-task={}", options.start_at_task));
        }

        step
    }

    /// Variables describing the run, always the last `-e` block
    fn metadata_vars(ctx: &JobContext<PlaybookOptions>) -> String {
        let user_id = ctx.job.created_by_id.unwrap_or(ctx.user.id);

        json!({
            "keel_job_id": ctx.job.id.to_string(),
            "keel_job_template_id": ctx.template.id.to_string(),
            "keel_job_template_name": ctx.template.name,
            "keel_user_id": user_id.to_string(),
            "keel_user_name": ctx.user.username,
            "keel_job_launch_type": ctx.job.launch_type.as_str(),
        })
        .to_string()
    }
}

impl JobFamily for AnsibleFamily {
    type Options = PlaybookOptions;

    fn name(&self) -> &'static str {
        "ansible"
    }

    fn queue_name(&self) -> &'static str {
        "ansible"
    }

    fn jobs_collection(&self) -> Collection {
        Collection::Jobs
    }

    fn templates_collection(&self) -> Collection {
        Collection::JobTemplates
    }

    fn timeout(&self, ctx: &JobContext<PlaybookOptions>) -> Duration {
        match ctx.job.spec.job_type {
            PlaybookJobType::UpdateJob => self.config.sync_job_timeout,
            _ => self.config.ansible_job_timeout,
        }
    }

    fn agent_credentials<'a>(&self, ctx: &'a JobContext<PlaybookOptions>) -> Vec<&'a Credential> {
        if ctx.job.spec.job_type == PlaybookJobType::UpdateJob {
            return ctx.scm.iter().filter(|c| c.has_ssh_key()).collect();
        }

        machine_and_network(ctx)
    }

    fn uses_cloud_credential(&self, ctx: &JobContext<PlaybookOptions>) -> bool {
        ctx.job.spec.job_type != PlaybookJobType::UpdateJob && ctx.cloud_credential().is_some()
    }

    fn working_dir(&self, ctx: &JobContext<PlaybookOptions>) -> PathBuf {
        match ctx.job.spec.job_type {
            PlaybookJobType::UpdateJob => sync::working_dir(&self.config),
            _ => ctx.project_root(&self.config.projects_home),
        }
    }

    fn build_command(
        &self,
        ctx: &JobContext<PlaybookOptions>,
        _paths: &JobPaths,
    ) -> Result<CommandPlan, FamilyError> {
        if ctx.job.spec.job_type == PlaybookJobType::UpdateJob {
            return sync::build_command(ctx, &self.config);
        }

        let mut main = Step::new("ansible-playbook").args(["-i".to_string(), self.inventory_plugin()]);
        main = Self::playbook_params(main, &ctx.job.spec);

        let mut pre_steps = Vec::new();
        let mut teardown = Vec::new();

        if let Some(machine) = ctx.machine.as_ref().filter(|m| !m.username.is_empty()) {
            let username = machine.qualified_username();
            main = main.arg("-u").arg(&username);

            if !machine.password.is_empty() {
                let password = self.codec.decrypt(&machine.password)?;
                match machine.kind {
                    CredentialKind::Ssh => {
                        main = main
                            .secure_arg("-e")
                            .secure_arg(format!("ansible_ssh_pass={}", password.expose()));
                    }
                    CredentialKind::Windows => {
                        pre_steps.push(Step::new("kinit").arg(&username).stdin(password).non_fatal());
                        teardown.push(Step::new("kdestroy").non_fatal());
                    }
                    _ => {}
                }
            }
        }

        if ctx.job.spec.become_enabled {
            main = main.arg("-b");

            if let Some(machine) = &ctx.machine {
                if !machine.become_method.is_empty() {
                    main = main.arg(format!("--become-method={}", machine.become_method));
                }
                if !machine.become_username.is_empty() {
                    main = main.arg(format!("--become-user={}", machine.become_username));
                }
                if !machine.become_password.is_empty() {
                    let password = self.codec.decrypt(&machine.become_password)?;
                    main = main
                        .secure_arg("-e")
                        .secure_arg(format!("ansible_become_pass={}", password.expose()));
                }
            }
        }

        main = main
            .arg("-e")
            .arg(Self::metadata_vars(ctx))
            .trailing_arg(&ctx.job.spec.playbook);

        let mut plan = CommandPlan::new(main, self.working_dir(ctx));
        plan.pre_steps = pre_steps;
        plan.teardown = teardown;
        Ok(plan)
    }

    fn build_environment(
        &self,
        ctx: &JobContext<PlaybookOptions>,
        agent: &AgentInfo,
    ) -> (Environment, Environment) {
        if ctx.job.spec.job_type == PlaybookJobType::UpdateJob {
            return sync::build_environment(ctx, &self.config, agent);
        }

        let project_root = ctx.project_root(&self.config.projects_home);
        let mut env = base_environment(&project_root, &self.config.projects_home, ctx.job.id, agent);

        if self.config.proot_enabled {
            env.set("PROOT_NO_SECCOMP", "1");
        }
        env.set("REST_API_URL", self.config.callback_url());
        env.set("ANSIBLE_PARAMIKO_RECORD_HOST_KEYS", "False");
        env.set(
            "ANSIBLE_CALLBACK_PLUGINS",
            self.config.data_dir.join("plugins/callback").display().to_string(),
        );
        env.set("ANSIBLE_HOST_KEY_CHECKING", "False");
        env.set("ANSIBLE_FORCE_COLOR", "True");
        env.set("INVENTORY_HOSTVARS", "True");
        if let Some(inventory_id) = ctx
            .inventory
            .as_ref()
            .map(|i| i.id)
            .or(ctx.job.spec.inventory_id)
        {
            env.set("INVENTORY_ID", inventory_id.to_string());
        }

        let mut audit = env.clone();
        set_token(&mut env, &mut audit, &ctx.token);
        (env, audit)
    }
}
