//! Project update jobs
//!
//! A project update runs the bundled `project_update.yml` playbook against
//! localhost to refresh the project checkout. Only the SCM key is loaded.

use keel_core::domain::ansible::PlaybookOptions;
use serde_json::{Map, Value as JsonValue, json};
use std::path::PathBuf;

use super::{CommandPlan, Environment, FamilyError, Step, base_environment};
use crate::config::Config;
use crate::context::JobContext;
use crate::service::agent::AgentInfo;

const UPDATE_PLAYBOOK: &str = "project_update.yml";

pub(super) fn working_dir(config: &Config) -> PathBuf {
    config.data_dir.join("playbooks")
}

/// SCM variables for the update playbook
///
/// Values already present on the job win; the rest are filled in from the
/// project record.
fn update_vars(ctx: &JobContext<PlaybookOptions>, config: &Config) -> Map<String, JsonValue> {
    let project = &ctx.project;
    let branch = if project.scm_branch.is_empty() {
        "HEAD"
    } else {
        project.scm_branch.as_str()
    };

    let defaults = json!({
        "scm_branch": branch,
        "scm_type": project.scm_type,
        "project_path": ctx.project_root(&config.projects_home).display().to_string(),
        "scm_clean": project.scm_clean,
        "scm_url": project.scm_url,
        "scm_delete_on_update": project.scm_delete_on_update,
        "scm_accept_hostkey": true,
    });

    let mut vars = ctx.job.spec.extra_vars.clone();
    if let JsonValue::Object(defaults) = defaults {
        for (key, value) in defaults {
            vars.entry(key).or_insert(value);
        }
    }
    vars
}

pub(super) fn build_command(
    ctx: &JobContext<PlaybookOptions>,
    config: &Config,
) -> Result<CommandPlan, FamilyError> {
    let project_root = ctx.project_root(&config.projects_home);
    std::fs::create_dir_all(&project_root).map_err(|e| {
        FamilyError::io(
            format!("unable to create project directory {}", project_root.display()),
            e,
        )
    })?;

    let playbook = if ctx.job.spec.playbook.is_empty() {
        UPDATE_PLAYBOOK
    } else {
        ctx.job.spec.playbook.as_str()
    };

    let vars = JsonValue::Object(update_vars(ctx, config)).to_string();
    let main = Step::new("ansible-playbook")
        .args(["-i", "localhost,", "-v", "-e"])
        .arg(vars)
        .trailing_arg(playbook);

    Ok(CommandPlan::new(main, working_dir(config)))
}

pub(super) fn build_environment(
    ctx: &JobContext<PlaybookOptions>,
    config: &Config,
    agent: &AgentInfo,
) -> (Environment, Environment) {
    let project_root = ctx.project_root(&config.projects_home);
    let mut env = base_environment(&project_root, &config.projects_home, ctx.job.id, agent);

    env.set("SHLVL", "1");
    env.set("ANSIBLE_PARAMIKO_RECORD_HOST_KEYS", "False");
    env.set(
        "ANSIBLE_CALLBACK_PLUGINS",
        config.data_dir.join("plugins/callback").display().to_string(),
    );
    env.set("ANSIBLE_HOST_KEY_CHECKING", "False");
    env.set("ANSIBLE_FORCE_COLOR", "True");

    // nothing secret in here
    let audit = env.clone();
    (env, audit)
}
