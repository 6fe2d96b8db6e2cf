//! Job families
//!
//! A job family is one external tool the runner knows how to drive. The
//! dispatcher, the dependency waiter, the state machine and the agent handling
//! are written once against [`JobFamily`]; each family only contributes the
//! pieces that differ between tools:
//! - which queue and collections it uses
//! - which credentials go into the SSH agent
//! - the command line(s) and the process environment

mod ansible;
mod environment;
mod sync;
mod terraform;

pub use ansible::AnsibleFamily;
pub use environment::Environment;
pub use terraform::TerraformFamily;

use keel_core::domain::collection::Collection;
use keel_core::domain::credential::Credential;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{JobContext, JobPaths};
use crate::secret::{Secret, SecretError};
use crate::service::agent::AgentInfo;

/// Errors raised while preparing a command. They fail the job before any
/// process is started.
#[derive(Debug, Error)]
pub enum FamilyError {
    #[error("unable to decrypt credential: {0}")]
    Secret(#[from] SecretError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to encode variables: {0}")]
    Encode(#[from] serde_json::Error),
}

impl FamilyError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// One process invocation
///
/// Arguments are kept in three ordered lists. `secure_args` hold decrypted
/// values and are only ever passed to the process; the audit trail is built
/// from `program`, `args` and `trailing_args`.
#[derive(Debug, Clone)]
pub struct Step {
    pub program: String,
    pub args: Vec<String>,
    pub secure_args: Vec<String>,
    pub trailing_args: Vec<String>,
    /// Written to the process stdin, which is closed afterwards
    pub stdin: Option<Secret>,
    /// A failing fatal step fails the job
    pub fatal: bool,
    /// Explanation recorded when this step fails, instead of the exit error
    pub failure_explanation: Option<String>,
}

impl Step {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secure_args: Vec::new(),
            trailing_args: Vec::new(),
            stdin: None,
            fatal: true,
            failure_explanation: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn secure_arg(mut self, arg: impl Into<String>) -> Self {
        self.secure_args.push(arg.into());
        self
    }

    pub fn trailing_arg(mut self, arg: impl Into<String>) -> Self {
        self.trailing_args.push(arg.into());
        self
    }

    pub fn stdin(mut self, input: Secret) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self
    }

    pub fn explain_failure(mut self, explanation: impl Into<String>) -> Self {
        self.failure_explanation = Some(explanation.into());
        self
    }

    /// Arguments passed to the process (program excluded)
    pub fn invocation_args(&self) -> Vec<String> {
        self.args
            .iter()
            .chain(&self.secure_args)
            .chain(&self.trailing_args)
            .cloned()
            .collect()
    }

    /// Program and arguments safe to persist
    pub fn audit_args(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(&self.args)
            .chain(&self.trailing_args)
            .cloned()
            .collect()
    }

    /// Runs this step through `wrapper`, e.g. a sandbox binary
    pub fn wrapped(self, wrapper: &str, wrapper_args: Vec<String>) -> Self {
        let mut args = wrapper_args;
        args.push(self.program);
        args.extend(self.args);

        Self {
            program: wrapper.to_string(),
            args,
            ..self
        }
    }
}

/// Everything needed to run a job
#[derive(Debug, Clone)]
pub struct CommandPlan {
    /// Run in order before `main`
    pub pre_steps: Vec<Step>,
    pub main: Step,
    /// Run after the job finished, whatever the outcome
    pub teardown: Vec<Step>,
    pub working_dir: PathBuf,
}

impl CommandPlan {
    pub fn new(main: Step, working_dir: PathBuf) -> Self {
        Self {
            pre_steps: Vec::new(),
            main,
            teardown: Vec::new(),
            working_dir,
        }
    }

    /// Applies `f` to every step of the plan
    pub fn map_steps(self, f: impl Fn(Step) -> Step) -> Self {
        Self {
            pre_steps: self.pre_steps.into_iter().map(&f).collect(),
            main: f(self.main),
            teardown: self.teardown.into_iter().map(&f).collect(),
            working_dir: self.working_dir,
        }
    }
}

/// Capability interface implemented once per tool family
pub trait JobFamily: Send + Sync + 'static {
    /// Family specific job options, flattened into the job record
    type Options: DeserializeOwned + std::fmt::Debug + Send + Sync + 'static;

    /// Family name, also used as the activity type
    fn name(&self) -> &'static str;

    fn queue_name(&self) -> &'static str;

    fn jobs_collection(&self) -> Collection;

    fn templates_collection(&self) -> Collection;

    /// Maximum run time of the main step
    fn timeout(&self, ctx: &JobContext<Self::Options>) -> Duration;

    /// Credentials whose keys are loaded into the SSH agent, in load order
    fn agent_credentials<'a>(&self, ctx: &'a JobContext<Self::Options>) -> Vec<&'a Credential>;

    /// Whether the cloud credential is materialized for this job
    fn uses_cloud_credential(&self, ctx: &JobContext<Self::Options>) -> bool {
        ctx.cloud_credential().is_some()
    }

    fn working_dir(&self, ctx: &JobContext<Self::Options>) -> PathBuf;

    /// Builds the steps of the job
    fn build_command(
        &self,
        ctx: &JobContext<Self::Options>,
        paths: &JobPaths,
    ) -> Result<CommandPlan, FamilyError>;

    /// Builds the process environment
    ///
    /// Returns the environment passed to the process and the audit-safe copy
    /// persisted as `job_env`.
    fn build_environment(
        &self,
        ctx: &JobContext<Self::Options>,
        agent: &AgentInfo,
    ) -> (Environment, Environment);
}

const DEFAULT_PATH: &str = "/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Entries shared by every family
fn base_environment(
    project_root: &Path,
    projects_home: &Path,
    job_id: Uuid,
    agent: &AgentInfo,
) -> Environment {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());

    let mut env = Environment::new();
    env.set("TERM", "xterm");
    env.set("PROJECT_PATH", project_root.display().to_string());
    env.set("HOME_PATH", projects_home.display().to_string());
    env.set("PWD", project_root.display().to_string());
    env.set("SHLVL", "0");
    env.set("HOME", home);
    env.set("PATH", DEFAULT_PATH);
    env.set("JOB_ID", job_id.to_string());
    env.set("SSH_AUTH_SOCK", agent.socket.display().to_string());
    env.set("SSH_AGENT_PID", agent.pid.to_string());
    env
}

/// Machine key first, then the network key when it is a different credential
fn machine_and_network<S>(ctx: &JobContext<S>) -> Vec<&Credential> {
    let machine = ctx.machine.as_ref().filter(|c| c.has_ssh_key());
    let network = ctx
        .network
        .as_ref()
        .filter(|c| c.has_ssh_key())
        .filter(|n| machine.is_none_or(|m| m.id != n.id));

    machine.into_iter().chain(network).collect()
}

/// Adds the callback token, masked in the audit copy
fn set_token(invocation: &mut Environment, audit: &mut Environment, token: &str) {
    invocation.set("REST_API_TOKEN", token);
    audit.set("REST_API_TOKEN", "*".repeat(token.len()));
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_args_exclude_secure_args() {
        let step = Step::new("ansible-playbook")
            .args(["-f", "4"])
            .secure_arg("-e")
            .secure_arg("ansible_ssh_pass=hunter2")
            .trailing_arg("site.yml");

        assert_eq!(
            step.invocation_args(),
            vec!["-f", "4", "-e", "ansible_ssh_pass=hunter2", "site.yml"]
        );
        assert_eq!(step.audit_args(), vec!["ansible-playbook", "-f", "4", "site.yml"]);
    }

    #[test]
    fn test_wrapped_keeps_secure_args_out_of_audit() {
        let step = Step::new("terraform")
            .arg("apply")
            .secure_arg("secret")
            .trailing_arg("modules/web")
            .wrapped("proot", vec!["-r".to_string(), "/".to_string()]);

        assert_eq!(step.program, "proot");
        assert_eq!(
            step.audit_args(),
            vec!["proot", "-r", "/", "terraform", "apply", "modules/web"]
        );
        assert!(step.invocation_args().contains(&"secret".to_string()));
    }

    #[test]
    fn test_token_is_masked_in_audit_env() {
        let mut invocation = Environment::new();
        let mut audit = Environment::new();
        set_token(&mut invocation, &mut audit, "abcd");

        assert_eq!(invocation.get("REST_API_TOKEN"), Some("abcd"));
        assert_eq!(audit.get("REST_API_TOKEN"), Some("****"));
    }
}
