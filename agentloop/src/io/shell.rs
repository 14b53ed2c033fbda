//! Local environment backed by one persistent bash process.
//!
//! Commands are written to bash's stdin followed by a marker line that prints the
//! exit code. A reader thread forwards stdout (stderr is merged into it) line by line
//! so a command can be abandoned after its timeout without deadlocking the pipe.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::{ExitStatus, Info};
use crate::io::environment::{
    CommandFile, CommandFileKind, Environment, SessionIdentity, StepResult,
};

const DONE_MARKER: &str = "<<AGENTLOOP_DONE>>";
const TIMEOUT_RETURNCODE: i32 = 124;

static SHELL_IDS: AtomicU64 = AtomicU64::new(0);

static SUBMISSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<<SUBMISSION\|\|(.*)\|\|SUBMISSION>>").unwrap());

/// Settings for [`LocalShellEnv::spawn`].
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub workdir: PathBuf,
    /// Per-command wall-clock limit.
    pub timeout: Duration,
    pub instance_id: String,
    pub name: String,
    pub persistent_volume: bool,
}

pub struct LocalShellEnv {
    options: ShellOptions,
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
    returncode: i32,
    bin_dir: PathBuf,
    session: SessionIdentity,
    restarts: u32,
}

impl LocalShellEnv {
    #[instrument(skip_all, fields(workdir = %options.workdir.display()))]
    pub fn spawn(options: ShellOptions) -> Result<Self> {
        let bin_dir = std::env::temp_dir().join(format!(
            "agentloop-{}-{}-{}",
            std::process::id(),
            SHELL_IDS.fetch_add(1, Ordering::Relaxed),
            sanitize(&options.instance_id)
        ));
        fs::create_dir_all(&bin_dir)
            .with_context(|| format!("create command dir {}", bin_dir.display()))?;

        let (child, stdin, lines) = start_bash(&options.workdir)?;
        let session = SessionIdentity {
            session_id: format!("local-{}-0", std::process::id()),
            instance_id: options.instance_id.clone(),
            name: options.name.clone(),
            persistent_volume: options.persistent_volume,
        };
        let mut env = Self {
            options,
            child,
            stdin,
            lines,
            returncode: 0,
            bin_dir,
            session,
            restarts: 0,
        };
        env.prepare_shell()?;
        info!(session = %env.session.session_id, "local shell started");
        Ok(env)
    }

    fn prepare_shell(&mut self) -> Result<()> {
        let bin = self.bin_dir.display().to_string();
        self.communicate(&format!("export PATH=\"{bin}:$PATH\""))?;
        if self.returncode != 0 {
            bail!("failed to prepare shell (return code {})", self.returncode);
        }
        Ok(())
    }

    /// Replace a wedged shell with a fresh one. Shell state is lost, so the session
    /// identity changes too.
    fn restart(&mut self) -> Result<()> {
        warn!("restarting local shell");
        let _ = self.child.kill();
        let _ = self.child.wait();
        let (child, stdin, lines) = start_bash(&self.options.workdir)?;
        self.child = child;
        self.stdin = stdin;
        self.lines = lines;
        self.restarts += 1;
        self.session.session_id = format!("local-{}-{}", std::process::id(), self.restarts);
        self.prepare_shell()
    }

    fn run(&mut self, command: &str) -> Result<(String, Option<i32>)> {
        let script = format!(
            "{command}\n__agentloop_rc=$?; printf '\\n%s%d\\n' '{DONE_MARKER}' \"$__agentloop_rc\"\n"
        );
        self.stdin
            .write_all(script.as_bytes())
            .context("write command to shell")?;
        self.stdin.flush().context("flush shell stdin")?;

        let deadline = Instant::now() + self.options.timeout;
        let mut collected: Vec<String> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) => {
                    if let Some(code) = line.strip_prefix(DONE_MARKER) {
                        // The marker is preceded by one newline of our own.
                        if collected.last().is_some_and(String::is_empty) {
                            collected.pop();
                        }
                        let rc = code.trim().parse().unwrap_or(-1);
                        return Ok((collected.join("\n"), Some(rc)));
                    }
                    collected.push(line);
                }
                Err(RecvTimeoutError::Timeout) => return Ok((collected.join("\n"), None)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("shell exited while running command"));
                }
            }
        }
    }

    fn write_command_file(&self, file: &CommandFile) -> Result<PathBuf> {
        let path = self.bin_dir.join(&file.name);
        fs::write(&path, &file.contents).with_context(|| format!("write {}", path.display()))?;
        if file.kind == CommandFileKind::Script {
            make_executable(&path)?;
        }
        Ok(path)
    }

    /// Stop the shell, waiting briefly before killing it.
    pub fn close(mut self) -> Result<()> {
        let _ = self.stdin.write_all(b"exit\n");
        let _ = self.stdin.flush();
        match self
            .child
            .wait_timeout(Duration::from_secs(2))
            .context("wait for shell exit")?
        {
            Some(status) => debug!(exit_code = ?status.code(), "shell exited"),
            None => {
                warn!("shell did not exit, killing");
                self.child.kill().context("kill shell")?;
                self.child.wait().context("wait shell after kill")?;
            }
        }
        Ok(())
    }
}

impl Drop for LocalShellEnv {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        let _ = fs::remove_dir_all(&self.bin_dir);
    }
}

impl Environment for LocalShellEnv {
    fn communicate(&mut self, command: &str) -> Result<String> {
        debug!(command, "communicate");
        let (output, rc) = self.run(command)?;
        match rc {
            Some(rc) => {
                self.returncode = rc;
                Ok(output)
            }
            None => {
                let secs = self.options.timeout.as_secs();
                warn!(timeout_secs = secs, "command timed out");
                self.restart()?;
                self.returncode = TIMEOUT_RETURNCODE;
                Ok(format!("{output}\nEXECUTION TIMED OUT after {secs} seconds"))
            }
        }
    }

    fn returncode(&self) -> i32 {
        self.returncode
    }

    fn step(&mut self, action: &str) -> Result<StepResult> {
        if let Some(status) = ExitStatus::from_action(action) {
            return self.finalize(status);
        }
        let observation = self.communicate(action)?;
        if let Some(caps) = SUBMISSION_RE.captures(&observation) {
            let submission = caps.get(1).map_or("", |m| m.as_str()).to_string();
            info!("submission received");
            return Ok(StepResult {
                observation: submission.clone(),
                reward: None,
                done: true,
                info: Info {
                    exit_status: Some("submitted".to_string()),
                    submission: Some(submission),
                    ..Info::default()
                },
            });
        }
        Ok(StepResult {
            observation,
            ..StepResult::default()
        })
    }

    fn add_commands(&mut self, files: &[CommandFile]) -> Result<()> {
        for file in files {
            let path = self.write_command_file(file)?;
            if file.kind == CommandFileKind::SourceFile {
                let output = self.communicate(&format!("source {}", path.display()))?;
                if self.returncode != 0 {
                    bail!("failed to source {}: {output}", file.name);
                }
            }
            debug!(name = %file.name, kind = ?file.kind, "installed command file");
        }
        Ok(())
    }

    fn session(&self) -> &SessionIdentity {
        &self.session
    }
}

impl LocalShellEnv {
    /// Finish an episode ended by an exit sentinel, keeping any pending diff as the
    /// submission.
    fn finalize(&mut self, status: ExitStatus) -> Result<StepResult> {
        let workdir = self.options.workdir.display().to_string();
        let diff = self.communicate(&format!("git -C '{workdir}' diff 2>/dev/null"))?;
        let mut info = Info::default();
        if self.returncode == 0 && !diff.trim().is_empty() {
            info.exit_status = Some(format!("submitted ({status})"));
            info.submission = Some(diff);
        } else {
            info.exit_status = Some(status.to_string());
        }
        Ok(StepResult {
            observation: String::new(),
            reward: None,
            done: true,
            info,
        })
    }
}

fn start_bash(workdir: &Path) -> Result<(Child, ChildStdin, Receiver<String>)> {
    let mut child = Command::new("bash")
        .arg("--norc")
        .arg("--noprofile")
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn bash in {}", workdir.display()))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    stdin
        .write_all(b"exec 2>&1\n")
        .context("merge shell stderr")?;
    Ok((child, stdin, spawn_reader(stdout)))
}

fn spawn_reader(stdout: ChildStdout) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
