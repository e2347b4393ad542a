//! Remote command execution and file upload on managed servers

use async_trait::async_trait;
use bastion_common::Server;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::SshConfig;
use crate::error::{Result, SecurityError};

/// Transport to a managed server. Failures are `Transport` errors and are
/// retried by the calling job.
#[async_trait]
pub trait RemoteExecutor: Send + Sync + 'static {
    /// Run commands in order, stopping at the first failure. Returns the
    /// combined output.
    async fn exec(&self, server: &Server, commands: &[String]) -> Result<String>;

    /// Write `contents` to `remote_path`, replacing it atomically
    async fn upload(&self, server: &Server, contents: &[u8], remote_path: &str) -> Result<()>;
}

/// Single-quote an argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}

/// Join commands into one `sh` script that stops at the first failure
pub fn script(commands: &[String]) -> String {
    let mut script = String::from("set -e\n");
    for command in commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// Parent directory of a remote path, `.` when there is none
pub fn parent_dir(remote_path: &str) -> &str {
    match remote_path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &remote_path[..idx],
        None => ".",
    }
}

/// `ssh` client driven through `tokio::process`
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn command(&self, server: &Server, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_seconds))
            .arg("-o")
            .arg(format!(
                "StrictHostKeyChecking={}",
                if self.config.strict_host_key_checking { "yes" } else { "accept-new" }
            ))
            .arg("-p")
            .arg(server.port.to_string());
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", server.user, server.host))
            .arg(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, server: &Server, remote: &str, stdin: &[u8]) -> Result<String> {
        let timeout = Duration::from_secs(self.config.command_timeout_seconds);
        let mut child = self.command(server, remote).spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin).await?;
            pipe.shutdown().await?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SecurityError::Transport(format!(
                    "ssh to {} timed out after {}s",
                    server.host,
                    timeout.as_secs()
                ))
            })??;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(SecurityError::Transport(format!(
                "ssh to {} exited with {}: {}",
                server.host,
                output.status,
                combined.trim()
            )))
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, server, commands), fields(server_id = server.id, commands = commands.len()))]
    async fn exec(&self, server: &Server, commands: &[String]) -> Result<String> {
        // The script travels over stdin so nothing needs a second round of quoting
        let output = self.run(server, "sh -s", script(commands).as_bytes()).await?;
        debug!(bytes = output.len(), "Remote commands finished");
        Ok(output)
    }

    #[instrument(skip(self, server, contents), fields(server_id = server.id, bytes = contents.len()))]
    async fn upload(&self, server: &Server, contents: &[u8], remote_path: &str) -> Result<()> {
        let staging = format!("{}.tmp.{}", remote_path, uuid::Uuid::new_v4().simple());
        let remote = format!(
            "mkdir -p {dir} && cat > {tmp} && mv -f {tmp} {dst}",
            dir = shell_quote(parent_dir(remote_path)),
            tmp = shell_quote(&staging),
            dst = shell_quote(remote_path),
        );
        self.run(server, &remote, contents).await?;
        debug!(remote_path, "Upload activated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/bastion/x.yaml"), "/data/bastion/x.yaml");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
    }

    #[test]
    fn test_script_stops_on_failure() {
        let s = script(&["mkdir -p /x".to_string(), "docker ps".to_string()]);
        assert_eq!(s, "set -e\nmkdir -p /x\ndocker ps\n");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/etc/crowdsec/acquis.yaml"), "/etc/crowdsec");
        assert_eq!(parent_dir("/acquis.yaml"), "/");
        assert_eq!(parent_dir("acquis.yaml"), ".");
    }
}
