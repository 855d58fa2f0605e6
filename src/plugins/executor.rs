//! Subprocess execution engine for attack plugins.
//!
//! Official plugins run in a dedicated interpreter inside a per-plugin
//! environment directory, so research-reference dependency closures never
//! leak into the host process. The wire contract: stderr carries
//! human-oriented progress ticks, stdout carries exactly one JSON document
//! (the serialized attack result) at termination.

use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AttackConfig, AttackPlugin, AttackResult, Availability};
use crate::error::{Error, Result};

const SHUTDOWN_GRACE_MS: u64 = 2_000;
const WAIT_POLL_MS: u64 = 10;
const STDERR_TAIL_LINES: usize = 20;

/// Progress sink for stderr lines.
pub type ProgressSink = Box<dyn Fn(&str) + Send>;

/// Deletes the transient config file on every exit path.
struct ConfigFileGuard(PathBuf);

impl Drop for ConfigFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            warn!(path = %self.0.display(), "failed to delete temp config: {e}");
        }
    }
}

/// How the wait loop ended.
enum ChildOutcome {
    Exited(i32),
    TimedOut(u64),
    Cancelled,
}

/// Executes an attack plugin in an isolated interpreter with its own
/// environment directory.
///
/// The executor blocks the calling thread on child I/O; async callers wrap
/// it in `spawn_blocking`. Stdout and stderr are drained on separate
/// threads so neither pipe backpressures into the other.
pub struct SubprocessExecutor {
    plugin_name: String,
    env_dir: PathBuf,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl SubprocessExecutor {
    pub fn new(plugin_name: impl Into<String>, env_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            env_dir: env_dir.into(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Wall-clock limit for the child process.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cooperative cancellation: the wait loop kills the child when the
    /// token fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Interpreter inside the plugin's environment directory.
    pub fn interpreter_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.env_dir.join("Scripts").join("python.exe")
        } else {
            self.env_dir.join("bin").join("python")
        }
    }

    /// Preflight: the environment directory and its interpreter must exist.
    /// Never touches the target.
    pub fn check_available(&self) -> Availability {
        if !self.env_dir.exists() {
            return Availability::Unavailable {
                message: format!(
                    "Environment not found for '{}': {}\n\n\
                     Remediation:\n\
                     1. Install the plugin environment: aipop plugins install {}\n\
                     2. Or fall back to the in-tree variant: --implementation legacy",
                    self.plugin_name,
                    self.env_dir.display(),
                    self.plugin_name,
                ),
            };
        }
        let interpreter = self.interpreter_path();
        if !interpreter.exists() {
            let host_python = which::which("python3")
                .map(|p| format!(" (host python3 found at {})", p.display()))
                .unwrap_or_default();
            return Availability::Unavailable {
                message: format!(
                    "Interpreter not found for '{}': {}{host_python}\n\n\
                     Remediation:\n\
                     1. Recreate the environment: aipop plugins install {} --force\n\
                     2. Or fall back to the in-tree variant: --implementation legacy",
                    self.plugin_name,
                    interpreter.display(),
                    self.plugin_name,
                ),
            };
        }
        Availability::Available
    }

    /// Run the plugin and parse its stdout as an [`AttackResult`].
    pub fn execute(
        &self,
        config: &Value,
        progress: Option<ProgressSink>,
    ) -> Result<AttackResult> {
        if let Availability::Unavailable { message } = self.check_available() {
            return Err(Error::plugin_unavailable(&self.plugin_name, message));
        }

        // Serialize the config to a transient file; the guard deletes it on
        // every exit path including panics.
        let config_path = std::env::temp_dir().join(format!(
            "aipop-{}-{}.json",
            self.plugin_name,
            Uuid::new_v4()
        ));
        std::fs::write(&config_path, serde_json::to_vec(config)?).map_err(|e| {
            Error::Config(format!("failed to write plugin config: {e}"))
        })?;
        let _guard = ConfigFileGuard(config_path.clone());

        let interpreter = self.interpreter_path();
        let runner_module = format!("aipop_plugins.runners.{}", self.plugin_name);
        let command_line = format!(
            "{} -m {} --config {}",
            interpreter.display(),
            runner_module,
            config_path.display()
        );
        info!(plugin = %self.plugin_name, %command_line, "executing plugin subprocess");

        // The child inherits the parent environment unchanged; auth tokens
        // travel as environment variables.
        let mut child = Command::new(&interpreter)
            .arg("-m")
            .arg(&runner_module)
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::infra(
                    "SubprocessError",
                    format!("failed to spawn {command_line}: {e}"),
                )
            })?;

        // Drain both pipes on their own threads. Killing the child closes
        // the pipes, which unblocks the readers.
        let stderr = child.stderr.take().expect("stderr was piped");
        let plugin_name = self.plugin_name.clone();
        let stderr_thread = std::thread::spawn(move || {
            let mut lines = Vec::new();
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                match &progress {
                    Some(sink) => sink(&line),
                    None => debug!(plugin = %plugin_name, "{line}"),
                }
                lines.push(line);
            }
            lines
        });

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stdout_thread = std::thread::spawn(move || {
            let mut out = String::new();
            let _ = stdout_pipe.read_to_string(&mut out);
            out
        });

        let outcome = self.wait_for_child(&mut child);

        let stderr_lines = stderr_thread.join().unwrap_or_default();
        let stdout = stdout_thread.join().unwrap_or_default();

        match outcome {
            ChildOutcome::Cancelled => Err(Error::Cancelled),
            ChildOutcome::TimedOut(elapsed_ms) => Err(Error::timeout(elapsed_ms)),
            ChildOutcome::Exited(0) => {
                serde_json::from_str::<AttackResult>(stdout.trim()).map_err(|e| {
                    Error::output_parse(
                        format!(
                            "plugin '{}' stdout is not a valid result: {e}",
                            self.plugin_name
                        ),
                        &stdout,
                    )
                })
            }
            ChildOutcome::Exited(code) => {
                let skip = stderr_lines.len().saturating_sub(STDERR_TAIL_LINES);
                Err(Error::plugin_execution(
                    code,
                    command_line,
                    stderr_lines[skip..].join("\n"),
                ))
            }
        }
    }

    /// Poll the child until it exits, the deadline passes, or cancellation
    /// fires. Timeout handling is graceful-then-forceful: a grace window
    /// after the deadline lets the child finish flushing before the kill.
    fn wait_for_child(&self, child: &mut Child) -> ChildOutcome {
        let start = Instant::now();
        let deadline = self.timeout.map(|t| start + t);
        let mut grace_deadline: Option<Instant> = None;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return ChildOutcome::Exited(status.code().unwrap_or(-1));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = %self.plugin_name, "wait failed: {e}");
                    let _ = child.kill();
                    let _ = child.wait();
                    return ChildOutcome::Exited(-1);
                }
            }

            if self.cancel.is_cancelled() {
                debug!(plugin = %self.plugin_name, "cancellation observed, killing child");
                let _ = child.kill();
                let _ = child.wait();
                return ChildOutcome::Cancelled;
            }

            let now = Instant::now();
            if let Some(grace) = grace_deadline {
                if now >= grace {
                    let _ = child.kill();
                    let _ = child.wait();
                    return ChildOutcome::TimedOut(start.elapsed().as_millis() as u64);
                }
            } else if let Some(d) = deadline {
                if now >= d {
                    debug!(
                        plugin = %self.plugin_name,
                        "deadline passed, granting {SHUTDOWN_GRACE_MS}ms grace before kill"
                    );
                    grace_deadline = Some(now + Duration::from_millis(SHUTDOWN_GRACE_MS));
                }
            }

            std::thread::sleep(Duration::from_millis(WAIT_POLL_MS));
        }
    }
}

/// Invokes a plugin's `run` in-process.
///
/// Functionally equivalent to the subprocess path but shares dependencies;
/// use only when compatibility has already been asserted.
pub struct DirectExecutor {
    plugin: std::sync::Arc<dyn AttackPlugin>,
}

impl DirectExecutor {
    pub fn new(plugin: std::sync::Arc<dyn AttackPlugin>) -> Self {
        Self { plugin }
    }

    pub fn check_available(&self) -> Availability {
        self.plugin.check_available()
    }

    pub async fn execute(&self, config: &AttackConfig) -> Result<AttackResult> {
        self.plugin.run(config).await
    }
}

/// Locate a plugin's environment directory under a plugins root.
pub fn plugin_env_dir(plugins_root: &Path, plugin_name: &str) -> PathBuf {
    plugins_root.join(plugin_name).join("venv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    /// Build a fake plugin environment whose "interpreter" is a shell
    /// script, so executor behavior can be exercised without Python.
    #[cfg(unix)]
    fn fake_env(dir: &Path, script_body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let env_dir = dir.join("venv");
        let bin = env_dir.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        env_dir
    }

    #[test]
    fn test_check_available_missing_env() {
        let executor = SubprocessExecutor::new("gcg", "/nonexistent/venv");
        let availability = executor.check_available();
        assert!(!availability.is_available());
        let message = availability.message().unwrap();
        assert!(message.contains("aipop plugins install gcg"));
        assert!(message.contains("--implementation legacy"));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_available_missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = dir.path().join("venv");
        std::fs::create_dir_all(&env_dir).unwrap();
        let executor = SubprocessExecutor::new("pair", &env_dir);
        let availability = executor.check_available();
        assert!(!availability.is_available());
        assert!(availability.message().unwrap().contains("Interpreter not found"));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_parses_stdout_result() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = fake_env(
            dir.path(),
            r#"echo 'progress tick' >&2
echo '{"success": true, "adversarial_prompts": ["adv"], "scores": [8.0], "metadata": {}, "cost": 0.1, "num_queries": 3, "execution_time": 0.5, "error": null}'"#,
        );

        let (tx, rx) = mpsc::channel::<String>();
        let executor = SubprocessExecutor::new("pair", env_dir);
        let result = executor
            .execute(
                &json!({"prompt": "X"}),
                Some(Box::new(move |line| {
                    let _ = tx.send(line.to_string());
                })),
            )
            .unwrap();

        assert!(result.success);
        assert_eq!(result.adversarial_prompts, vec!["adv"]);
        assert_eq!(result.num_queries, 3);
        // Stderr lines reached the progress sink.
        assert_eq!(rx.try_recv().unwrap(), "progress tick");
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_nonzero_exit_carries_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = fake_env(
            dir.path(),
            "echo 'ImportError: no module named torch' >&2\nexit 3",
        );

        let executor = SubprocessExecutor::new("gcg", env_dir);
        let err = executor.execute(&json!({}), None).unwrap_err();
        match err {
            Error::PluginExecution {
                exit_code,
                stderr_tail,
                command,
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr_tail.contains("ImportError"));
                assert!(command.contains("aipop_plugins.runners.gcg"));
            }
            other => panic!("expected PluginExecution, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_unparseable_stdout_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = fake_env(dir.path(), "echo 'this is not json'");

        let executor = SubprocessExecutor::new("autodan", env_dir);
        let err = executor.execute(&json!({}), None).unwrap_err();
        match err {
            Error::OutputParse { output_head, .. } => {
                assert!(output_head.contains("this is not json"));
            }
            other => panic!("expected OutputParse, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_deleted_on_all_paths() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = fake_env(dir.path(), "exit 1");

        let count_configs = || {
            std::fs::read_dir(std::env::temp_dir())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("aipop-pair-"))
                .count()
        };
        let before = count_configs();

        let executor = SubprocessExecutor::new("pair", env_dir);
        let _ = executor.execute(&json!({}), None);

        assert_eq!(count_configs(), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_hung_child() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = fake_env(dir.path(), "sleep 60");

        let executor = SubprocessExecutor::new("pair", env_dir)
            .with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = executor.execute(&json!({}), None).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
        // 100ms deadline + 2s grace, well under the 60s sleep.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancellation_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = fake_env(dir.path(), "sleep 60");

        let token = CancellationToken::new();
        token.cancel();
        let executor = SubprocessExecutor::new("pair", env_dir).with_cancellation(token);
        let start = Instant::now();
        let err = executor.execute(&json!({}), None).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_plugin_env_dir_layout() {
        let root = PathBuf::from("/opt/aipop/plugins");
        assert_eq!(
            plugin_env_dir(&root, "gcg"),
            PathBuf::from("/opt/aipop/plugins/gcg/venv")
        );
    }
}
