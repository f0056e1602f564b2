//! Supervised long-running processes.
//!
//! The pipeline hands finished builds to a [`ProcessSupervisor`]. The
//! production implementation drives the `pm2` CLI.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::util::extract_json_array;

/// Everything needed to launch one supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub run_command: String,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn start(&self, spec: &ProcessSpec) -> Result<()>;

    /// Restart an existing process, picking up `spec.env`.
    async fn restart(&self, spec: &ProcessSpec) -> Result<()>;

    /// Stop and forget the named process.
    async fn stop(&self, name: &str) -> Result<()>;

    async fn start_or_restart(&self, spec: &ProcessSpec) -> Result<()> {
        if self.exists(&spec.name).await? {
            self.restart(spec).await
        } else {
            self.start(spec).await
        }
    }
}

/// Ask the OS for a currently unused TCP port.
///
/// The listener is closed before returning, so another process could claim
/// the port before the supervisor binds it.
pub fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).context("Failed to bind an ephemeral port")?;
    let port = listener
        .local_addr()
        .context("Failed to read ephemeral port")?
        .port();
    Ok(port)
}

/// Names of the processes in `pm2 jlist` output, restricted to `namespace`
/// when the entry records one.
pub fn parse_process_names(jlist: &str, namespace: &str) -> Result<Vec<String>> {
    let list = extract_json_array(jlist).context("pm2 jlist did not return a JSON array")?;
    let names = list
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| {
                    entry
                        .pointer("/pm2_env/namespace")
                        .and_then(|ns| ns.as_str())
                        .is_none_or(|ns| ns == namespace)
                })
                .filter_map(|entry| entry.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(names)
}

pub struct Pm2Supervisor {
    program: String,
    namespace: String,
    timeout: Duration,
}

impl Pm2Supervisor {
    pub fn new(program: impl Into<String>, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            namespace: namespace.into(),
            timeout,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a pm2 invocation, returning stdout. Non-zero exit is an error.
    async fn run(&self, mut cmd: Command, what: &str) -> Result<String> {
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("pm2 {} timed out after {}s", what, self.timeout.as_secs()))?
            .with_context(|| format!("Failed to run {} {}", self.program, what))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pm2 {} failed ({}): {}",
                what,
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProcessSupervisor for Pm2Supervisor {
    async fn exists(&self, name: &str) -> Result<bool> {
        let stdout = self.run(self.command(&["jlist"]), "jlist").await?;
        let names = parse_process_names(&stdout, &self.namespace)?;
        debug!(name, count = names.len(), "pm2 process list");
        Ok(names.iter().any(|n| n == name))
    }

    async fn start(&self, spec: &ProcessSpec) -> Result<()> {
        let work_dir = spec.work_dir.to_string_lossy();
        let mut cmd = self.command(&[
            "start",
            &spec.run_command,
            "--name",
            &spec.name,
            "--namespace",
            &self.namespace,
            "--cwd",
            &work_dir,
        ]);
        cmd.current_dir(&spec.work_dir).envs(spec.env.iter().cloned());
        self.run(cmd, "start").await?;
        info!(name = %spec.name, cwd = %work_dir, "pm2 process started");
        Ok(())
    }

    async fn restart(&self, spec: &ProcessSpec) -> Result<()> {
        let mut cmd = self.command(&["restart", &spec.name, "--update-env"]);
        cmd.current_dir(&spec.work_dir).envs(spec.env.iter().cloned());
        self.run(cmd, "restart").await?;
        info!(name = %spec.name, "pm2 process restarted");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run(self.command(&["delete", name]), "delete").await?;
        info!(name, "pm2 process deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_allocate_port_is_non_zero() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
        // Released, so it can be bound again.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_parse_process_names_filters_namespace() {
        let jlist = r#"[
            {"name": "42", "pm2_env": {"namespace": "prdeploy"}},
            {"name": "api", "pm2_env": {"namespace": "default"}},
            {"name": "7"}
        ]"#;
        let names = parse_process_names(jlist, "prdeploy").unwrap();
        assert_eq!(names, vec!["42".to_string(), "7".to_string()]);
    }

    #[test]
    fn test_parse_process_names_skips_daemon_banner() {
        let jlist = "[PM2] Spawning PM2 daemon\n[PM2] PM2 Successfully daemonized\n[]";
        assert!(parse_process_names(jlist, "prdeploy").unwrap().is_empty());
    }

    #[test]
    fn test_parse_process_names_rejects_garbage() {
        assert!(parse_process_names("command not found", "prdeploy").is_err());
    }

    /// A stand-in `pm2` that logs its arguments and the PORT it saw, and
    /// answers `jlist` from a file.
    fn fake_pm2(dir: &std::path::Path) -> PathBuf {
        let script = dir.join("pm2");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nLOG={log}\nif [ \"$1\" = jlist ]; then cat {list}; exit 0; fi\n\
                 echo \"$* PORT=$PORT\" >> \"$LOG\"\n",
                log = dir.join("calls.log").display(),
                list = dir.join("jlist.json").display(),
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.join("jlist.json"), r#"[{"name":"42","pm2_env":{"namespace":"previews"}}]"#)
            .unwrap();
        script
    }

    fn spec(dir: &std::path::Path, name: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.into(),
            work_dir: dir.to_path_buf(),
            env: vec![("PORT".into(), "4100".into())],
            run_command: "npm start".into(),
        }
    }

    #[tokio::test]
    async fn test_pm2_start_or_restart_picks_by_existence() {
        let dir = tempfile::tempdir().unwrap();
        let pm2 = fake_pm2(dir.path());
        let supervisor =
            Pm2Supervisor::new(pm2.to_string_lossy(), "previews", Duration::from_secs(10));

        assert!(supervisor.exists("42").await.unwrap());
        assert!(!supervisor.exists("43").await.unwrap());

        supervisor.start_or_restart(&spec(dir.path(), "42")).await.unwrap();
        supervisor.start_or_restart(&spec(dir.path(), "43")).await.unwrap();
        supervisor.stop("42").await.unwrap();

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines[0], "restart 42 --update-env PORT=4100");
        assert!(lines[1].starts_with("start npm start --name 43 --namespace previews --cwd "));
        assert!(lines[1].ends_with("PORT=4100"));
        assert!(lines[2].starts_with("delete 42"));
    }

    #[tokio::test]
    async fn test_pm2_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pm2");
        std::fs::write(&script, "#!/bin/sh\necho 'process not found' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let supervisor =
            Pm2Supervisor::new(script.to_string_lossy(), "previews", Duration::from_secs(10));
        let err = supervisor.stop("42").await.unwrap_err();
        assert!(err.to_string().contains("process not found"));
    }
}
