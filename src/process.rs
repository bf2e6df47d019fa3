#![forbid(unsafe_code)]

//! Runs external tools with streamed stdout, a bounded stderr tail and a
//! hard timeout.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{ConvertError, Result};

const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ToolRun {
    pub success: bool,
    pub status: String,
    pub stderr_tail: String,
}

/// Spawns `command`, hands every stdout line to `on_line` and waits for the
/// process. Once `timeout` elapses the child is killed together with anything
/// it started, so inherited pipes close and the call returns.
pub fn run_streaming(
    mut command: Command,
    label: &str,
    timeout: Duration,
    mut on_line: impl FnMut(&str),
) -> Result<ToolRun> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut command, 0);
    let mut child = command
        .spawn()
        .map_err(|err| ConvertError::invocation(format!("could not start {label}: {err}")))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let child = Arc::new(Mutex::new(child));
    let deadline = Instant::now() + timeout;
    let finished = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));

    let watchdog = {
        let child = child.clone();
        let finished = finished.clone();
        let timed_out = timed_out.clone();
        thread::spawn(move || {
            while !finished.load(Ordering::Acquire) {
                if Instant::now() >= deadline {
                    timed_out.store(true, Ordering::Release);
                    kill(&child);
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
        })
    };

    let stderr_reader = stderr.map(|stream| thread::spawn(move || collect_tail(stream)));

    if let Some(stream) = stdout {
        for chunk in BufReader::new(stream).split(b'\n') {
            let Ok(bytes) = chunk else {
                break;
            };
            let line = String::from_utf8_lossy(&bytes);
            on_line(line.trim_end_matches('\r'));
        }
    }

    let status = loop {
        let polled = child.lock().try_wait();
        match polled {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    timed_out.store(true, Ordering::Release);
                    kill(&child);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                finished.store(true, Ordering::Release);
                return Err(ConvertError::invocation(format!(
                    "waiting for {label} failed: {err}"
                )));
            }
        }
    };
    finished.store(true, Ordering::Release);
    let _ = watchdog.join();

    let stderr_tail = stderr_reader
        .and_then(|handle| handle.join().ok())
        .map(|lines| lines.into_iter().collect::<Vec<_>>().join("\n"))
        .unwrap_or_default();

    if timed_out.load(Ordering::Acquire) {
        return Err(ConvertError::invocation_with(
            format!("{label} timed out after {}s", timeout.as_secs()),
            stderr_tail,
        ));
    }

    Ok(ToolRun {
        success: status.success(),
        status: status.to_string(),
        stderr_tail,
    })
}

/// The child leads its own process group; the whole group goes down even
/// when the child itself has already exited.
fn kill(child: &Mutex<Child>) {
    let mut child = child.lock();
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Ok(pgid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
}

fn collect_tail(stream: impl Read) -> VecDeque<String> {
    let mut lines = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for chunk in BufReader::new(stream).split(b'\n') {
        let Ok(bytes) = chunk else {
            break;
        };
        let line = String::from_utf8_lossy(&bytes).trim().to_string();
        if line.is_empty() {
            continue;
        }
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }
    lines
}
