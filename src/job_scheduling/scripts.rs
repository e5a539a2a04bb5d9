//! Run scripts executed on the director before and after a job

use super::job_context::JobHandle;
use super::types::JobStatus;
use crate::errors::{HandlerError, HandlerResult};
use crate::resources::RunScript;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Values substituted for the `%` codes of a script command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCodes {
    pub client: String,
    pub director: String,
    pub job_id: String,
    pub job: String,
    pub level: String,
    pub name: String,
    pub job_type: String,
    pub exit: String,
}

impl ScriptCodes {
    pub fn of(job: &JobHandle, director: &str) -> Self {
        let state = job.state();
        Self {
            client: state.client.name.clone(),
            director: director.to_string(),
            job_id: state.job_id.to_string(),
            job: state.job.clone(),
            level: state.level.to_string(),
            name: job.definition().name.clone(),
            job_type: state.job_type.to_string(),
            exit: state.status.exit_text().to_string(),
        }
    }

    /// Replace `%c %d %i %j %l %n %t %e` and `%%`; unknown codes are kept as written
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                Some('c') => out.push_str(&self.client),
                Some('d') => out.push_str(&self.director),
                Some('i') => out.push_str(&self.job_id),
                Some('j') => out.push_str(&self.job),
                Some('l') => out.push_str(&self.level),
                Some('n') => out.push_str(&self.name),
                Some('t') => out.push_str(&self.job_type),
                Some('e') => out.push_str(&self.exit),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}

/// Run one command through `sh -c`, logging its output
pub async fn run_command(command: &str, job: &str) -> HandlerResult<()> {
    debug!("Job {} running script: {}", job, command);
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!("{}: script: {}", job, line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        warn!("{}: script: {}", job, line);
    }

    if output.status.success() {
        Ok(())
    } else {
        Err(HandlerError::Script {
            command: command.to_string(),
            message: match output.status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
        })
    }
}

/// Run the before-job scripts; the first failing one marked
/// `fail_job_on_error` aborts the job
pub async fn run_before_scripts(job: &JobHandle, director: &str) -> HandlerResult<()> {
    let scripts: Vec<&RunScript> = job
        .definition()
        .run_scripts
        .iter()
        .filter(|script| script.before)
        .collect();
    for script in scripts {
        let command = ScriptCodes::of(job, director).expand(&script.command);
        if let Err(e) = run_command(&command, &job.name()).await {
            if script.fail_job_on_error {
                return Err(e);
            }
            warn!("Before-job script of {} failed: {}", job.name(), e);
        }
    }
    Ok(())
}

/// Run the after-job scripts matching how the job ended; failures are logged only
pub async fn run_after_scripts(job: &JobHandle, director: &str) {
    let succeeded = job.status() == JobStatus::Terminated;
    let scripts: Vec<&RunScript> = job
        .definition()
        .run_scripts
        .iter()
        .filter(|script| !script.before)
        .filter(|script| {
            if succeeded {
                script.on_success
            } else {
                script.on_failure
            }
        })
        .collect();
    for script in scripts {
        let command = ScriptCodes::of(job, director).expand(&script.command);
        if let Err(e) = run_command(&command, &job.name()).await {
            warn!("After-job script of {} failed: {}", job.name(), e);
        }
    }
}
