//! Remote execution channel over `ssh`/`scp`/`rsync`, with host key pinning.
//!
//! The channel is where the activity probe hooks in: every operation (and
//! every delivered chunk of an interactive shell) pings the
//! [`ActivityPinger`], so any traffic through the channel counts as
//! instance activity without the callers doing anything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::command_runner::{CommandRunner, TokioCommandRunner};
use crate::probe::ActivityPinger;

/// Default per-operation timeout. Remote installs legitimately run for
/// minutes; 15 minutes bounds a wedged connection without cutting them off.
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(900);

/// Remote execution operations. The orchestrator and installers depend on
/// this trait so tests can script remote behavior without a network.
#[allow(async_fn_in_trait)]
pub trait Channel {
    /// Run a remote command, returning its stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the command exits nonzero.
    async fn run(&self, command: &str) -> Result<String>;

    /// Run a remote command, returning whether it exited zero. Transport
    /// failures are still errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn run_ok(&self, command: &str) -> Result<bool>;

    /// Copy a local file to a remote path.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    async fn put(&self, local: &Path, remote: &str) -> Result<()>;

    /// Whether a remote path exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Copy a local directory tree to a remote path, skipping `exclude`
    /// patterns. Remote-only files are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    async fn sync(&self, local: &Path, remote: &str, exclude: &[&str]) -> Result<()>;
}

/// Production channel shelling out to OpenSSH client tools.
pub struct SshChannel {
    host: String,
    user: String,
    key_file: PathBuf,
    env: BTreeMap<String, String>,
    known_hosts: PathBuf,
    runner: TokioCommandRunner,
    pinger: Option<Arc<ActivityPinger>>,
}

impl SshChannel {
    #[must_use]
    pub fn new(host: &str, user: &str, key_file: &Path, known_hosts: PathBuf) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            key_file: key_file.to_path_buf(),
            env: BTreeMap::new(),
            known_hosts,
            runner: TokioCommandRunner::new(CHANNEL_TIMEOUT),
            pinger: None,
        }
    }

    /// Variables exported at the start of every remote command.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Attach an activity pinger; channel traffic then marks the instance
    /// as interacted-with.
    #[must_use]
    pub fn with_pinger(mut self, pinger: Arc<ActivityPinger>) -> Self {
        self.pinger = Some(pinger);
        self
    }

    fn ping(&self) {
        if let Some(pinger) = &self.pinger {
            pinger.ping();
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` and `scp`. `accept-new` pins the host key on
    /// first contact and rejects changes afterwards.
    fn ssh_options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_file.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
        ]
    }

    /// Remote script: env exports followed by the command.
    fn script(&self, command: &str) -> String {
        let mut script = String::new();
        for (key, value) in &self.env {
            script.push_str(&format!("export {key}={value}; "));
        }
        script.push_str(command);
        script
    }

    async fn ssh_output(&self, command: &str) -> Result<std::process::Output> {
        self.ping();
        let mut args = self.ssh_options();
        args.push(self.target());
        args.push(self.script(command));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run("ssh", &arg_refs).await
    }

    /// Interactive remote shell (or a single foreground command) with the
    /// user's terminal attached. Output is streamed chunk by chunk through
    /// this process so each delivered chunk can ping the activity probe.
    ///
    /// # Errors
    ///
    /// Returns an error if `ssh` cannot be spawned or the stream breaks.
    pub async fn shell(&self, command: Option<&str>) -> Result<std::process::ExitStatus> {
        let mut args = self.ssh_options();
        args.push("-tt".to_string());
        args.push(self.target());
        if let Some(command) = command {
            args.push(self.script(command));
        } else if !self.env.is_empty() {
            // No command: start a login shell with the profile vars set.
            args.push(format!("{} exec $SHELL -l", self.script("")));
        }

        let mut child = tokio::process::Command::new("ssh")
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ssh")?;

        let mut stdout = child.stdout.take().context("ssh stdout unavailable")?;
        let mut local = tokio::io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            let n = stdout.read(&mut buf).await.context("reading ssh stream")?;
            if n == 0 {
                break;
            }
            self.ping();
            local.write_all(&buf[..n]).await.context("writing to stdout")?;
            local.flush().await.context("flushing stdout")?;
        }
        child.wait().await.context("waiting for ssh")
    }
}

impl Channel for SshChannel {
    async fn run(&self, command: &str) -> Result<String> {
        let output = self.ssh_output(command).await?;
        if !output.status.success() {
            anyhow::bail!(
                "remote command failed on {}: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_ok(&self, command: &str) -> Result<bool> {
        Ok(self.ssh_output(command).await?.status.success())
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.ping();
        let mut args = self.ssh_options();
        args.push(local.display().to_string());
        args.push(format!("{}:{remote}", self.target()));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.runner.run("scp", &arg_refs).await?;
        if !output.status.success() {
            anyhow::bail!(
                "copy to {}:{remote} failed: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.run_ok(&format!("test -e {path}")).await
    }

    async fn sync(&self, local: &Path, remote: &str, exclude: &[&str]) -> Result<()> {
        self.ping();
        let ssh_cmd = {
            let mut parts = vec!["ssh".to_string()];
            parts.extend(self.ssh_options());
            parts.join(" ")
        };
        let mut args = vec!["-az".to_string()];
        for pattern in exclude {
            args.push(format!("--exclude={pattern}"));
        }
        args.push("-e".to_string());
        args.push(ssh_cmd);
        // Trailing slash: sync directory contents, not the directory itself.
        args.push(format!("{}/", local.display()));
        args.push(format!("{}:{remote}", self.target()));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.runner.run("rsync", &arg_refs).await?;
        if !output.status.success() {
            anyhow::bail!(
                "sync to {}:{remote} failed: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Manages `~/.fermata/known_hosts` for host key pinning.
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    /// Manager pointing at `~/.fermata/known_hosts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self::with_path(home.join(".fermata").join("known_hosts")))
    }

    /// Manager pointing at an arbitrary path (for testing).
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scan `host` with `ssh-keyscan` and pin its keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails or the file cannot be written.
    pub async fn register(&self, host: &str, runner: &impl CommandRunner) -> Result<()> {
        let output = runner.run("ssh-keyscan", &["-H", host]).await?;
        if !output.status.success() {
            anyhow::bail!("ssh-keyscan {host} failed");
        }
        self.append(&String::from_utf8_lossy(&output.stdout))
    }

    /// Append key lines, skipping comments and lines already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub fn append(&self, key_lines: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
            set_permissions(parent, 0o700)?;
        }
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let mut content = existing.clone();
        for line in key_lines.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if existing.lines().any(|l| l.trim() == line) {
                continue;
            }
            content.push_str(line);
            content.push('\n');
        }
        std::fs::write(&self.path, content)
            .with_context(|| format!("write {}", self.path.display()))?;
        set_permissions(&self.path, 0o600)
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn channel() -> SshChannel {
        SshChannel::new(
            "198.51.100.7",
            "ubuntu",
            Path::new("/keys/id.pem"),
            PathBuf::from("/tmp/kh"),
        )
    }

    #[test]
    fn ssh_options_pin_host_keys() {
        let opts = channel().ssh_options();
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert!(opts.iter().any(|o| o == "UserKnownHostsFile=/tmp/kh"));
        assert_eq!(opts[1], "/keys/id.pem");
    }

    #[test]
    fn script_prefixes_env_exports() {
        let mut env = BTreeMap::new();
        env.insert("RUST_LOG".to_string(), "info".to_string());
        env.insert("APP_MODE".to_string(), "dev".to_string());
        let chan = channel().with_env(env);
        assert_eq!(
            chan.script("hostname"),
            "export APP_MODE=dev; export RUST_LOG=info; hostname"
        );
    }

    #[test]
    fn script_without_env_is_the_bare_command() {
        assert_eq!(channel().script("hostname"), "hostname");
    }

    #[test]
    fn target_combines_user_and_host() {
        assert_eq!(channel().target(), "ubuntu@198.51.100.7");
    }

    #[test]
    fn append_deduplicates_key_lines() {
        let dir = TempDir::new().expect("tempdir");
        let kh = KnownHosts::with_path(dir.path().join("known_hosts"));
        kh.append("host1 ssh-ed25519 AAAA\n# comment\n").expect("first");
        kh.append("host1 ssh-ed25519 AAAA\nhost2 ssh-ed25519 BBBB\n")
            .expect("second");
        let content = std::fs::read_to_string(kh.path()).expect("read");
        assert_eq!(content, "host1 ssh-ed25519 AAAA\nhost2 ssh-ed25519 BBBB\n");
    }

    #[cfg(unix)]
    #[test]
    fn append_sets_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().expect("tempdir");
        let kh = KnownHosts::with_path(dir.path().join("sub").join("known_hosts"));
        kh.append("host1 ssh-ed25519 AAAA\n").expect("append");
        let file_mode = std::fs::metadata(kh.path()).expect("meta").permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(dir.path().join("sub"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
