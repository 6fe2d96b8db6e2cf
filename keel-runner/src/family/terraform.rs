//! Terraform job family

use keel_core::domain::collection::Collection;
use keel_core::domain::credential::Credential;
use keel_core::domain::terraform::{TerraformJobType, TerraformOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    CommandPlan, Environment, FamilyError, JobFamily, Step, base_environment, machine_and_network,
    set_token,
};
use crate::config::Config;
use crate::context::{JobContext, JobPaths};
use crate::service::agent::AgentInfo;

pub struct TerraformFamily {
    config: Config,
}

impl TerraformFamily {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// `terraform get` run before every job to fetch modules
    fn get_step(options: &TerraformOptions) -> Step {
        let mut step = Step::new("terraform").arg("get");
        if options.update_on_launch {
            step = step.arg("-update");
        }
        if !options.directory.is_empty() {
            step = step.trailing_arg(&options.directory);
        }
        step.explain_failure("terraform get failed")
    }

    fn operation_args(options: &TerraformOptions) -> Vec<String> {
        let args: &[&str] = match options.job_type {
            TerraformJobType::Apply => &["apply", "-input=false"],
            TerraformJobType::Plan => &["plan", "-input=false"],
            TerraformJobType::Destroy => &["destroy", "-force"],
            TerraformJobType::DestroyPlan => &["plan", "-destroy", "-input=false"],
        };

        let mut args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        if options.job_type == TerraformJobType::Destroy && !options.target.is_empty() {
            args.push("-target".to_string());
            args.push(options.target.clone());
        }
        if options.parallelism != 0 {
            args.push(format!("-parallelism={}", options.parallelism));
        }
        args
    }
}

/// Writes the job variables as a tfvars JSON file readable only by the runner
fn write_var_file(dir: &Path, ctx: &JobContext<TerraformOptions>) -> Result<PathBuf, FamilyError> {
    let path = dir.join(format!("{}.tfvars.json", ctx.job.id));
    let content = serde_json::to_vec_pretty(&ctx.job.spec.vars)?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(&path)
        .map_err(|e| FamilyError::io("unable to create variable file", e))?;
    file.write_all(&content)
        .map_err(|e| FamilyError::io("unable to write variable file", e))?;

    Ok(path)
}

impl JobFamily for TerraformFamily {
    type Options = TerraformOptions;

    fn name(&self) -> &'static str {
        "terraform"
    }

    fn queue_name(&self) -> &'static str {
        "terraform"
    }

    fn jobs_collection(&self) -> Collection {
        Collection::TerraformJobs
    }

    fn templates_collection(&self) -> Collection {
        Collection::TerraformJobTemplates
    }

    fn timeout(&self, _ctx: &JobContext<TerraformOptions>) -> Duration {
        self.config.terraform_job_timeout
    }

    fn agent_credentials<'a>(&self, ctx: &'a JobContext<TerraformOptions>) -> Vec<&'a Credential> {
        machine_and_network(ctx)
    }

    fn working_dir(&self, ctx: &JobContext<TerraformOptions>) -> PathBuf {
        ctx.project_root(&self.config.projects_home)
    }

    fn build_command(
        &self,
        ctx: &JobContext<TerraformOptions>,
        paths: &JobPaths,
    ) -> Result<CommandPlan, FamilyError> {
        let options = &ctx.job.spec;

        let mut main = Step::new("terraform").args(Self::operation_args(options));
        if !options.vars.is_empty() {
            let var_file = write_var_file(&paths.tmp_rand, ctx)?;
            main = main.arg(format!("-var-file={}", var_file.display()));
        }
        if !options.directory.is_empty() {
            main = main.trailing_arg(&options.directory);
        }

        let mut plan = CommandPlan::new(main, self.working_dir(ctx));
        plan.pre_steps.push(Self::get_step(options));
        Ok(plan)
    }

    fn build_environment(
        &self,
        ctx: &JobContext<TerraformOptions>,
        agent: &AgentInfo,
    ) -> (Environment, Environment) {
        let project_root = ctx.project_root(&self.config.projects_home);
        let mut env = base_environment(&project_root, &self.config.projects_home, ctx.job.id, agent);

        if self.config.proot_enabled {
            env.set("PROOT_NO_SECCOMP", "1");
        }
        env.set("REST_API_URL", self.config.callback_url());
        env.set("TF_IN_AUTOMATION", "1");

        let mut audit = env.clone();
        set_token(&mut env, &mut audit, &ctx.token);
        (env, audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::tests_support::terraform_context;
    use serde_json::json;

    #[test]
    fn test_apply_with_vars_and_directory() {
        let family = TerraformFamily::new(Config::default());
        let mut ctx = terraform_context();
        ctx.job.spec.directory = "stacks/web".to_string();
        ctx.job.spec.parallelism = 5;
        ctx.job.spec.vars.insert("region".to_string(), json!("eu-west-1"));

        let base = tempfile::tempdir().unwrap();
        let paths = JobPaths::create(base.path()).unwrap();
        let plan = family.build_command(&ctx, &paths).unwrap();

        let args = plan.main.invocation_args();
        assert_eq!(&args[..3], ["apply", "-input=false", "-parallelism=5"]);
        assert_eq!(args.last().unwrap(), "stacks/web");

        let var_file = args
            .iter()
            .find_map(|a| a.strip_prefix("-var-file="))
            .unwrap();
        assert!(var_file.ends_with(".tfvars.json"));
        let content: serde_json::Value =
            serde_json::from_slice(&std::fs::read(var_file).unwrap()).unwrap();
        assert_eq!(content["region"], "eu-west-1");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(var_file).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_get_step_precedes_main() {
        let family = TerraformFamily::new(Config::default());
        let mut ctx = terraform_context();
        ctx.job.spec.update_on_launch = true;
        ctx.job.spec.directory = "stacks/db".to_string();

        let base = tempfile::tempdir().unwrap();
        let paths = JobPaths::create(base.path()).unwrap();
        let plan = family.build_command(&ctx, &paths).unwrap();

        assert_eq!(plan.pre_steps.len(), 1);
        let get = &plan.pre_steps[0];
        assert_eq!(get.audit_args(), vec!["terraform", "get", "-update", "stacks/db"]);
        assert!(get.fatal);
        assert_eq!(get.failure_explanation.as_deref(), Some("terraform get failed"));
    }

    #[test]
    fn test_destroy_variants() {
        let mut options = TerraformOptions {
            job_type: TerraformJobType::Destroy,
            ..Default::default()
        };
        assert_eq!(TerraformFamily::operation_args(&options), vec!["destroy", "-force"]);

        options.target = "aws_instance.web".to_string();
        assert_eq!(
            TerraformFamily::operation_args(&options),
            vec!["destroy", "-force", "-target", "aws_instance.web"]
        );

        options.job_type = TerraformJobType::DestroyPlan;
        assert_eq!(
            TerraformFamily::operation_args(&options),
            vec!["plan", "-destroy", "-input=false"]
        );
    }
}
