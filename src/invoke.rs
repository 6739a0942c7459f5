use crate::config::WorkerConfig;
use crate::error::{StageError, ToolError, ToolFailure};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Environment handed to every external tool of one job.
#[derive(Debug, Clone, Default)]
pub struct ToolEnv {
    vars: Vec<(String, OsString)>,
}

impl ToolEnv {
    /// Locates the EMAN2 libraries and interpreter paths and adds the
    /// configured extras. Runs once per job before anything is invoked.
    pub fn prepare(config: &WorkerConfig) -> Result<Self, StageError> {
        let mut env = ToolEnv::default();

        if let Some(dir) = &config.eman2_dir {
            if !dir.is_dir() {
                return Err(StageError::Environment(format!(
                    "EMAN2 directory {} does not exist",
                    dir.display()
                )));
            }
            let bin = dir.join("bin");
            let lib = dir.join("lib");

            env.set("EMAN2DIR", dir.as_os_str().to_owned());
            env.set("PATH", prepend_path(&bin, std::env::var_os("PATH"))?);
            env.set(
                "LD_LIBRARY_PATH",
                prepend_path(&lib, std::env::var_os("LD_LIBRARY_PATH"))?,
            );
            env.set(
                "PYTHONPATH",
                std::env::join_paths([lib, bin])
                    .map_err(|err| StageError::Environment(err.to_string()))?,
            );
        }

        for (key, value) in &config.tool_env {
            env.set(key, value.into());
        }

        Ok(env)
    }

    pub fn set(&mut self, key: &str, value: OsString) {
        self.vars.retain(|(existing, _)| existing != key);
        self.vars.push((key.to_string(), value));
    }

    pub fn get(&self, key: &str) -> Option<&OsString> {
        self.vars
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &OsString)> {
        self.vars.iter().map(|(key, value)| (key.as_str(), value))
    }
}

fn prepend_path(first: &Path, rest: Option<OsString>) -> Result<OsString, StageError> {
    let mut paths = vec![first.to_path_buf()];
    if let Some(rest) = rest {
        paths.extend(std::env::split_paths(&rest));
    }
    std::env::join_paths(paths).map_err(|err| StageError::Environment(err.to_string()))
}

/// Runs external programs inside one working directory under a wall-clock limit.
#[derive(Debug, Clone)]
pub struct Invoker {
    working_dir: PathBuf,
    timeout: Duration,
    env: ToolEnv,
}

impl Invoker {
    pub fn new(working_dir: impl Into<PathBuf>, timeout: Duration, env: ToolEnv) -> Self {
        Invoker {
            working_dir: working_dir.into(),
            timeout,
            env,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Runs `program` to completion and returns its combined output.
    pub async fn run(&self, program: &Path, args: &[String]) -> Result<String, ToolError> {
        self.execute(program, args, None).await
    }

    /// Like [`Invoker::run`], feeding `input` to the program's stdin first.
    pub async fn run_with_input(
        &self,
        program: &Path,
        args: &[String],
        input: &[u8],
    ) -> Result<String, ToolError> {
        self.execute(program, args, Some(input)).await
    }

    async fn execute(
        &self,
        program: &Path,
        args: &[String],
        input: Option<&[u8]>,
    ) -> Result<String, ToolError> {
        let name = program.display().to_string();
        debug!(program = %name, args = ?args, dir = %self.working_dir.display(), "Invoking tool");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .envs(self.env.vars())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| ToolError {
            program: name.clone(),
            failure: ToolFailure::Spawn(err),
            output: String::new(),
        })?;
        let capture = OutputCapture::start(&mut child);

        let stdin = child.stdin.take();
        let run = async {
            if let (Some(bytes), Some(mut stdin)) = (input, stdin) {
                if let Err(err) = stdin.write_all(bytes).await {
                    // The tool may exit without reading its prompt answer.
                    warn!(program = %name, error = %err, "Failed writing tool stdin");
                }
                drop(stdin);
            }
            child.wait().await
        };

        let status = match tokio::time::timeout(self.timeout, run).await {
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!(program = %name, error = %err, "Failed to kill timed out tool");
                }
                return Err(ToolError {
                    program: name,
                    failure: ToolFailure::Timeout(self.timeout),
                    output: capture.abort(),
                });
            }
            Ok(Err(err)) => {
                return Err(ToolError {
                    program: name,
                    failure: ToolFailure::Io(err),
                    output: capture.abort(),
                })
            }
            Ok(Ok(status)) => status,
        };

        let output = capture.finish().await;
        if !status.success() {
            return Err(ToolError {
                program: name,
                failure: ToolFailure::Exit(status),
                output,
            });
        }

        Ok(output)
    }
}

/// Drains a child's stdout and stderr into one buffer, chunks appended in
/// the order they arrive. What was read so far stays available when the
/// child has to be abandoned.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    fn start(child: &mut Child) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain(stdout, buffer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain(stderr, buffer.clone())));
        }
        OutputCapture { buffer, readers }
    }

    /// Waits for both streams to close.
    async fn finish(mut self) -> String {
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        self.snapshot()
    }

    /// Stops reading. Grandchildren may still hold the pipes open.
    fn abort(self) -> String {
        for reader in &self.readers {
            reader.abort();
        }
        self.snapshot()
    }

    fn snapshot(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

async fn drain<R: AsyncRead + Unpin>(mut stream: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend_from_slice(&chunk[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn invoker(dir: &Path, timeout: Duration) -> Invoker {
        Invoker::new(dir, timeout, ToolEnv::default())
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = invoker(dir.path(), Duration::from_secs(10))
            .run(Path::new("sh"), &sh("echo out; echo err >&2"))
            .await
            .unwrap();

        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn runs_inside_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        invoker(dir.path(), Duration::from_secs(10))
            .run(Path::new("sh"), &sh("printf data > made.txt"))
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("made.txt")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let err = invoker(dir.path(), Duration::from_secs(10))
            .run(Path::new("sh"), &sh("echo broken; exit 3"))
            .await
            .unwrap_err();

        match err.failure {
            ToolFailure::Exit(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected failure {other:?}"),
        }
        assert!(err.output.contains("broken"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = invoker(dir.path(), Duration::from_secs(10))
            .run(Path::new("/nonexistent/denss.py"), &[])
            .await
            .unwrap_err();

        assert!(matches!(err.failure, ToolFailure::Spawn(_)));
        assert!(err.to_string().contains("/nonexistent/denss.py"));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = invoker(dir.path(), Duration::from_millis(200))
            .run(Path::new("sh"), &sh("sleep 10"))
            .await
            .unwrap_err();

        assert!(matches!(err.failure, ToolFailure::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_keeps_output_read_so_far() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = invoker(dir.path(), Duration::from_millis(300))
            .run(Path::new("sh"), &sh("echo iteration 1 of 3000; sleep 10"))
            .await
            .unwrap_err();

        assert!(matches!(err.failure, ToolFailure::Timeout(_)));
        assert!(err.output.contains("iteration 1 of 3000"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn output_keeps_arrival_order_across_streams() {
        let dir = tempfile::tempdir().unwrap();
        let out = invoker(dir.path(), Duration::from_secs(10))
            .run(
                Path::new("sh"),
                &sh("echo first; sleep 0.2; echo second >&2; sleep 0.2; echo third"),
            )
            .await
            .unwrap();

        assert_eq!(out, "first\nsecond\nthird\n");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = invoker(dir.path(), Duration::from_secs(10))
            .run_with_input(Path::new("sh"), &sh("read answer; echo got $answer"), b"2\n")
            .await
            .unwrap();

        assert_eq!(out.trim(), "got 2");
    }

    #[tokio::test]
    async fn passes_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ToolEnv::default();
        env.set("DENSS_TEST_VALUE", "grid".into());
        let out = Invoker::new(dir.path(), Duration::from_secs(10), env)
            .run(Path::new("sh"), &sh("echo $DENSS_TEST_VALUE"))
            .await
            .unwrap();

        assert_eq!(out.trim(), "grid");
    }

    #[test]
    fn prepare_points_at_eman2_install() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            eman2_dir: Some(dir.path().to_path_buf()),
            tool_env: [("OMP_NUM_THREADS".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };

        let env = ToolEnv::prepare(&config).unwrap();
        assert_eq!(env.get("EMAN2DIR"), Some(&dir.path().as_os_str().to_owned()));
        let path = env.get("PATH").unwrap();
        let first = std::env::split_paths(path).next().unwrap();
        assert_eq!(first, dir.path().join("bin"));
        assert_eq!(env.get("OMP_NUM_THREADS"), Some(&OsString::from("1")));
    }

    #[test]
    fn prepare_rejects_missing_eman2_install() {
        let config = WorkerConfig {
            eman2_dir: Some(PathBuf::from("/nonexistent/eman2")),
            ..Default::default()
        };

        assert!(matches!(
            ToolEnv::prepare(&config),
            Err(StageError::Environment(_))
        ));
    }
}
