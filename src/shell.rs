//! SSH remote shell implementation
//!
//! All remote I/O in this crate flows through the [`RemoteTransport`] trait.
//! Production code uses [`OpenSshTransport`]; tests inject
//! [`crate::testing::MockFleet`]. [`SshClient`] binds a transport to one
//! `(host, user)` pair and adds bounded retries for transient failures.

use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use openssh::{KnownHosts, Session, Stdio};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// File holding the machine id generated at install time
const MACHINE_ID_FILE: &str = "/etc/openvstorage_id";

/// Transient failures are retried this many times before surfacing
const RETRY_ATTEMPTS: u32 = 3;

/// Base backoff between retries; multiplied by the attempt number
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Low-level remote operations against a named host.
///
/// Implementations must be safe to share between concurrent installer
/// operations; every method is addressed by host so a single transport can
/// serve the whole fleet.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Execute a command, optionally feeding `stdin`, returning stdout.
    async fn exec(
        &self,
        host: &str,
        user: &str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<String>;

    async fn file_read(&self, host: &str, user: &str, path: &str) -> Result<String>;

    async fn file_write(
        &self,
        host: &str,
        user: &str,
        path: &str,
        content: &str,
        mode: Option<u32>,
    ) -> Result<()>;

    async fn file_upload(&self, host: &str, user: &str, remote: &str, local: &str) -> Result<()>;

    async fn file_exists(&self, host: &str, user: &str, path: &str) -> Result<bool>;

    async fn file_delete(&self, host: &str, user: &str, path: &str) -> Result<()>;

    /// Create directories, parents included. Existing paths are a no-op.
    async fn dir_create(&self, host: &str, user: &str, paths: &[String]) -> Result<()>;

    async fn dir_delete(&self, host: &str, user: &str, paths: &[String]) -> Result<()>;

    async fn dir_chmod(
        &self,
        host: &str,
        user: &str,
        paths: &[String],
        mode: u32,
        recursive: bool,
    ) -> Result<()>;

    async fn dir_chown(
        &self,
        host: &str,
        user: &str,
        paths: &[String],
        owner: &str,
        group: &str,
        recursive: bool,
    ) -> Result<()>;
}

/// Quote a string for safe interpolation into `sh -c`.
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Production transport over OpenSSH master connections.
///
/// Sessions are established lazily and cached per `(host, user)`. File and
/// directory primitives are expressed as shell commands over the session;
/// file content travels over stdin so no temporary files are needed on
/// either side.
pub struct OpenSshTransport {
    sessions: Mutex<HashMap<(String, String), Arc<Session>>>,
}

impl OpenSshTransport {
    pub fn new() -> Self {
        OpenSshTransport {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn session(&self, host: &str, user: &str) -> Result<Arc<Session>> {
        let key = (host.to_string(), user.to_string());
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(session.clone());
        }
        let destination = format!("ssh://{}@{}", user, host);
        trace!("Opening SSH session to {}", destination);
        let session = Session::connect(&destination, KnownHosts::Accept)
            .await
            .map_err(|e| {
                InstallerError::Connection(format!("Failed to connect to {}: {}", host, e))
            })?;
        let session = Arc::new(session);
        sessions.insert(key, session.clone());
        Ok(session)
    }
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn exec(
        &self,
        host: &str,
        user: &str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        let session = self.session(host, user).await?;
        let mut remote = session.command("sh");
        remote.arg("-c").arg(command);
        remote.stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            remote.stdin(Stdio::piped());
        }
        let mut child = remote.spawn().await.map_err(|e| {
            InstallerError::Connection(format!("Failed to spawn `{}` on {}: {}", command, host, e))
        })?;
        if let Some(data) = stdin {
            let mut handle = child
                .stdin()
                .take()
                .ok_or_else(|| InstallerError::Connection("stdin unavailable".to_string()))?;
            handle.write_all(data).await.map_err(|e| {
                InstallerError::Connection(format!("Failed to write stdin on {}: {}", host, e))
            })?;
        }
        let output = child.wait_with_output().await.map_err(|e| {
            InstallerError::Connection(format!("Lost connection to {}: {}", host, e))
        })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(InstallerError::CommandFailed {
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    async fn file_read(&self, host: &str, user: &str, path: &str) -> Result<String> {
        self.exec(host, user, &format!("cat {}", sh_quote(path)), None)
            .await
    }

    async fn file_write(
        &self,
        host: &str,
        user: &str,
        path: &str,
        content: &str,
        mode: Option<u32>,
    ) -> Result<()> {
        self.exec(
            host,
            user,
            &format!("cat > {}", sh_quote(path)),
            Some(content.as_bytes()),
        )
        .await?;
        if let Some(mode) = mode {
            self.exec(
                host,
                user,
                &format!("chmod {:o} {}", mode, sh_quote(path)),
                None,
            )
            .await?;
        }
        Ok(())
    }

    async fn file_upload(&self, host: &str, user: &str, remote: &str, local: &str) -> Result<()> {
        let content = tokio::fs::read_to_string(local)
            .await
            .map_err(|e| InstallerError::Connection(format!("Failed to read {}: {}", local, e)))?;
        self.file_write(host, user, remote, &content, None).await
    }

    async fn file_exists(&self, host: &str, user: &str, path: &str) -> Result<bool> {
        let output = self
            .exec(
                host,
                user,
                &format!("test -e {} && echo True || echo False", sh_quote(path)),
                None,
            )
            .await?;
        Ok(output.trim() == "True")
    }

    async fn file_delete(&self, host: &str, user: &str, path: &str) -> Result<()> {
        self.exec(host, user, &format!("rm -f {}", sh_quote(path)), None)
            .await?;
        Ok(())
    }

    async fn dir_create(&self, host: &str, user: &str, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = paths.iter().map(|p| sh_quote(p)).collect();
        self.exec(host, user, &format!("mkdir -p {}", quoted.join(" ")), None)
            .await?;
        Ok(())
    }

    async fn dir_delete(&self, host: &str, user: &str, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = paths.iter().map(|p| sh_quote(p)).collect();
        self.exec(host, user, &format!("rm -rf {}", quoted.join(" ")), None)
            .await?;
        Ok(())
    }

    async fn dir_chmod(
        &self,
        host: &str,
        user: &str,
        paths: &[String],
        mode: u32,
        recursive: bool,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let flag = if recursive { "-R " } else { "" };
        let quoted: Vec<String> = paths.iter().map(|p| sh_quote(p)).collect();
        self.exec(
            host,
            user,
            &format!("chmod {}{:o} {}", flag, mode, quoted.join(" ")),
            None,
        )
        .await?;
        Ok(())
    }

    async fn dir_chown(
        &self,
        host: &str,
        user: &str,
        paths: &[String],
        owner: &str,
        group: &str,
        recursive: bool,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let flag = if recursive { "-R " } else { "" };
        let quoted: Vec<String> = paths.iter().map(|p| sh_quote(p)).collect();
        self.exec(
            host,
            user,
            &format!("chown {}{}:{} {}", flag, owner, group, quoted.join(" ")),
            None,
        )
        .await?;
        Ok(())
    }
}

/// Remote shell bound to one host.
///
/// Wraps a [`RemoteTransport`] with the per-host operation surface used by
/// the installers. Transient connection failures are retried
/// [`RETRY_ATTEMPTS`] times with linear backoff; command failures surface
/// immediately.
#[derive(Clone)]
pub struct SshClient {
    transport: Arc<dyn RemoteTransport>,
    host: String,
    user: String,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("host", &self.host)
            .field("user", &self.user)
            .finish()
    }
}

impl SshClient {
    /// Create a client for `host` as the root user.
    pub fn new(transport: Arc<dyn RemoteTransport>, host: impl Into<String>) -> Self {
        SshClient {
            transport,
            host: host.into(),
            user: "root".to_string(),
        }
    }

    /// Override the remote user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    debug!(
                        "Transient failure on {} (attempt {}): {}",
                        self.host, attempt, err
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Run a command, returning stdout. Raises on nonzero exit.
    pub async fn run(&self, command: &str) -> Result<String> {
        debug!("[{}] {}", self.host, command);
        self.with_retry(|| self.transport.exec(&self.host, &self.user, command, None))
            .await
    }

    /// Run a command with bytes fed to its stdin.
    pub async fn run_with_input(&self, command: &str, stdin: &[u8]) -> Result<String> {
        debug!("[{}] {} (with stdin)", self.host, command);
        self.with_retry(|| {
            self.transport
                .exec(&self.host, &self.user, command, Some(stdin))
        })
        .await
    }

    pub async fn file_read(&self, path: &str) -> Result<String> {
        self.with_retry(|| self.transport.file_read(&self.host, &self.user, path))
            .await
    }

    pub async fn file_write(&self, path: &str, content: &str, mode: Option<u32>) -> Result<()> {
        self.with_retry(|| {
            self.transport
                .file_write(&self.host, &self.user, path, content, mode)
        })
        .await
    }

    pub async fn file_upload(&self, remote: &str, local: &str) -> Result<()> {
        self.with_retry(|| {
            self.transport
                .file_upload(&self.host, &self.user, remote, local)
        })
        .await
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        self.with_retry(|| self.transport.file_exists(&self.host, &self.user, path))
            .await
    }

    pub async fn file_delete(&self, path: &str) -> Result<()> {
        self.with_retry(|| self.transport.file_delete(&self.host, &self.user, path))
            .await
    }

    pub async fn dir_create(&self, paths: &[String]) -> Result<()> {
        self.with_retry(|| self.transport.dir_create(&self.host, &self.user, paths))
            .await
    }

    pub async fn dir_delete(&self, paths: &[String]) -> Result<()> {
        self.with_retry(|| self.transport.dir_delete(&self.host, &self.user, paths))
            .await
    }

    pub async fn dir_chmod(&self, paths: &[String], mode: u32, recursive: bool) -> Result<()> {
        self.with_retry(|| {
            self.transport
                .dir_chmod(&self.host, &self.user, paths, mode, recursive)
        })
        .await
    }

    pub async fn dir_chown(
        &self,
        paths: &[String],
        owner: &str,
        group: &str,
        recursive: bool,
    ) -> Result<()> {
        self.with_retry(|| {
            self.transport
                .dir_chown(&self.host, &self.user, paths, owner, group, recursive)
        })
        .await
    }

    /// Unique machine id of this host, generated at install time.
    pub async fn machine_id(&self) -> Result<String> {
        let output = self.run(&format!("cat {}", MACHINE_ID_FILE)).await?;
        Ok(output.trim().to_string())
    }
}
