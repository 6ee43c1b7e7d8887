//! Spawning the interpreter and collecting what it prints.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};

use super::executor::{ScriptError, ScriptInput, ScriptOutput};

/// Bytes kept per output stream. The rest is read and discarded so the
/// interpreter never blocks on a full pipe.
const OUTPUT_LIMIT: usize = 10 * 1024 * 1024;

/// How long a killed interpreter's pipes are drained before giving up.
/// Processes the interpreter started can keep them open after it dies.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run `cmd` (interpreter and arguments already set) with `input` applied
/// and wait for it to exit.
///
/// On timeout the child is killed and whatever it printed so far is
/// returned in [`ScriptError::Timeout`]. The child is also killed when the
/// returned future is dropped.
pub async fn run_command(
    mut cmd: Command,
    input: ScriptInput,
) -> Result<ScriptOutput, ScriptError> {
    cmd.envs(input.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &input.current_dir {
        cmd.current_dir(dir);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(ScriptError::Spawn)?;

    let stdout = Captured::default();
    let stderr = Captured::default();
    let stdout_task = tokio::spawn(capture(child.stdout.take(), stdout.clone()));
    let stderr_task = tokio::spawn(capture(child.stderr.take(), stderr.clone()));

    let stdin = child.stdin.take();
    let payload = serde_json::to_vec(&input.stdin).unwrap_or_default();
    let exited = async {
        feed(stdin, payload).await;
        child.wait().await
    };

    let waited = match input.timeout {
        Some(limit) => tokio::time::timeout(limit, exited).await.ok(),
        None => Some(exited.await),
    };

    let Some(waited) = waited else {
        let _ = child.start_kill();
        let _ = child.wait().await;
        let elapsed_ms = elapsed_ms(started);
        let _ = tokio::time::timeout(DRAIN_GRACE, async {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
        })
        .await;
        return Err(ScriptError::Timeout {
            elapsed_ms,
            stdout: stdout.take_string(),
            stderr: stderr.take_string(),
        });
    };

    let status = waited.map_err(ScriptError::Wait)?;
    let duration_ms = elapsed_ms(started);

    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let stdout = stdout.take_string();
    let stderr = stderr.take_string();
    let parsed_output = serde_json::from_str(stdout.trim()).ok();

    Ok(ScriptOutput {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        duration_ms,
        parsed_output,
    })
}

/// Output of one stream, shared between its reader task and the caller so
/// a partial capture survives a kill.
#[derive(Debug, Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn append(&self, bytes: &[u8]) {
        if let Ok(mut kept) = self.0.lock() {
            let room = OUTPUT_LIMIT.saturating_sub(kept.len());
            kept.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
    }

    fn take_string(&self) -> String {
        let bytes = self
            .0
            .lock()
            .map(|mut kept| std::mem::take(&mut *kept))
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Write the payload and close stdin.
async fn feed(stdin: Option<ChildStdin>, payload: Vec<u8>) {
    if let Some(mut stdin) = stdin {
        // The interpreter may exit without reading stdin.
        let _ = stdin.write_all(&payload).await;
    }
}

/// Read a stream to its end into `sink`, which keeps the first
/// [`OUTPUT_LIMIT`] bytes.
async fn capture<R>(stream: Option<R>, sink: Captured)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut stream) = stream else {
        return;
    };

    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.append(&chunk[..n]),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
