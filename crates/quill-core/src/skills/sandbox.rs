//! Out-of-process script execution for skill tools

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

use crate::{Error, Result};

/// One script invocation
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub script: PathBuf,
    /// Written to the script's stdin as JSON
    pub input: JsonValue,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Stdout was cut at the output cap
    pub truncated: bool,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs skill scripts somewhere other than this process
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, request: ScriptRequest) -> Result<ScriptOutput>;
}

/// Child-process sandbox
///
/// The child gets an empty environment apart from `PATH`, `HOME` and
/// `TMPDIR`, all pointing at a throwaway scratch directory that is also its
/// working directory. A launcher prefix such as `bwrap --unshare-all --` or
/// `firejail --net=none` adds namespace isolation when configured.
pub struct ProcessSandbox {
    launcher: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(launcher: Vec<String>) -> Self {
        Self { launcher }
    }

    fn interpreter(script: &Path) -> Option<&'static str> {
        match script.extension().and_then(|e| e.to_str()) {
            Some("sh") | Some("bash") => Some("sh"),
            Some("py") => Some("python3"),
            Some("js") => Some("node"),
            _ => None,
        }
    }

    fn command(&self, script: &Path) -> Command {
        let mut argv: Vec<String> = self.launcher.clone();
        if let Some(interpreter) = Self::interpreter(script) {
            argv.push(interpreter.to_string());
        }
        argv.push(script.to_string_lossy().into_owned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(&self, request: ScriptRequest) -> Result<ScriptOutput> {
        if !request.script.is_file() {
            return Err(Error::NotFound(format!("script {}", request.script.display())));
        }

        let scratch = tempfile::Builder::new().prefix("quill-skill-").tempdir()?;
        let mut cmd = self.command(&request.script);
        cmd.env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(script = %request.script.display(), "Running skill script");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ToolExecution(format!("failed to start {}: {}", request.script.display(), e)))?;

        let payload = serde_json::to_vec(&request.input)?;
        let cap = request.max_output_bytes;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // feeding, draining and waiting share one deadline
        let exchange = async {
            let (_, out, err, status) = tokio::join!(
                feed(stdin, payload),
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            );
            Ok::<_, std::io::Error>((out?, err?, status?))
        };

        let ((stdout, truncated), (stderr, _), status) = match tokio::time::timeout(request.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(script = %request.script.display(), timeout = ?request.timeout, "Skill script timed out");
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Script already gone");
                }
                return Err(Error::Timeout(format!(
                    "script {} exceeded {}s",
                    request.script.display(),
                    request.timeout.as_secs_f64()
                )));
            }
        };

        Ok(ScriptOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
            truncated,
        })
    }
}

async fn feed(stdin: Option<ChildStdin>, payload: Vec<u8>) {
    let Some(mut stdin) = stdin else {
        return;
    };
    // a script that never reads its input closes the pipe early
    if let Err(e) = stdin.write_all(&payload).await {
        debug!(error = %e, "Script did not consume its input");
    }
}

/// Keep at most `cap` bytes; the rest is read and discarded so the child never blocks on a full pipe
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut buf = Vec::new();
    let mut limited = reader.take((cap as u64).saturating_add(1));
    limited.read_to_end(&mut buf).await?;
    if buf.len() <= cap {
        return Ok((buf, false));
    }
    buf.truncate(cap);
    tokio::io::copy(&mut limited.into_inner(), &mut tokio::io::sink()).await?;
    Ok((buf, true))
}
