//! Stub tools and a scripted converter shared by the unit tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{ConvertError, Result};
use crate::invoker::{ConvertOutput, ConvertRequest, Converter};

#[cfg(unix)]
fn write_executable(path: &Path, script: &str) {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, script).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// Fake yt-dlp. Prints templated progress, then depending on the URL:
/// `*missing*` fails without output, `*leftover*` leaves an unconverted
/// `.webm` and fails, anything else writes the converted file.
#[cfg(unix)]
pub fn install_ytdlp_stub(dir: &Path) -> PathBuf {
    let path = dir.join("yt-dlp");
    let script = r#"#!/usr/bin/env bash
set -eu
output=""
url=""
ext="mp3"
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o|--output) shift; output="$1" ;;
    --merge-output-format) shift; ext="$1" ;;
    --progress-template|--print|-f|--format|--audio-format|--audio-quality|--ffmpeg-location) shift ;;
    http*) url="$1" ;;
  esac
  shift
done
target="${output//%(id)s/vid}"
echo "MCTITLE|Stub Title: Part 1"
for pct in 10 50 100; do
  echo "MCPROGRESS|${pct}|100|NA|${pct}.0%"
done
case "$url" in
  *missing*)
    echo "ERROR: [youtube] missing: Video unavailable" >&2
    exit 1
    ;;
  *leftover*)
    printf 'raw' > "${target//%(ext)s/webm}"
    echo "ERROR: Postprocessing: ffprobe and ffmpeg not found" >&2
    exit 1
    ;;
esac
final="${target//%(ext)s/$ext}"
printf 'converted' > "$final"
echo "MCOUTPUT|$final"
"#;
    write_executable(&path, script);
    path
}

/// Fake ffmpeg: copies the `-i` input to the last argument, failing when the
/// input name contains "broken".
#[cfg(unix)]
pub fn install_ffmpeg_stub(dir: &Path) -> PathBuf {
    let path = dir.join("ffmpeg");
    let script = r#"#!/usr/bin/env bash
set -eu
input=""
prev=""
for arg in "$@"; do
  if [[ "$prev" == "-i" ]]; then input="$arg"; fi
  prev="$arg"
done
output="${@: -1}"
if [[ "$input" == *broken* ]]; then
  echo "Invalid data found when processing input" >&2
  exit 1
fi
cp "$input" "$output"
"#;
    write_executable(&path, script);
    path
}

#[derive(Clone, Copy, Debug)]
pub enum Script {
    /// Reports the given progress values, then writes the output file.
    Succeed,
    /// Fails with an invocation error after reporting progress.
    Fail,
    /// Writes the output file, then fails: leaves a partial behind.
    FailAfterWrite,
    Panic,
}

/// Scripted converter. Optionally blocks inside `convert` until released so
/// tests can observe a job while it is running.
pub struct FakeConverter {
    script: Script,
    steps: Vec<u8>,
    calls: AtomicUsize,
    gate: Mutex<Option<Arc<Gate>>>,
}

pub struct Gate {
    entered: Notify,
    released: std::sync::Mutex<bool>,
    condvar: std::sync::Condvar,
}

impl Gate {
    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    fn wait(&self) {
        self.entered.notify_one();
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.condvar.wait(released).unwrap();
        }
    }
}

impl FakeConverter {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            steps: vec![5, 30, 50, 70],
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn with_steps(mut self, steps: Vec<u8>) -> Self {
        self.steps = steps;
        self
    }

    /// Makes the next conversions block until `Gate::release`.
    pub fn gated(self) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            released: std::sync::Mutex::new(false),
            condvar: std::sync::Condvar::new(),
        });
        *self.gate.lock() = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Converter for FakeConverter {
    fn convert(
        &self,
        request: &ConvertRequest,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ConvertOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for step in &self.steps {
            progress(*step, "Downloading");
        }
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait();
        }

        let output = request.work_dir.join(format!(
            "{}.{}",
            request.key.id,
            request.key.profile.extension()
        ));
        match self.script {
            Script::Succeed => {
                fs::write(&output, b"media").unwrap();
                Ok(ConvertOutput {
                    path: output,
                    title: "Never Gonna Give You Up".to_string(),
                })
            }
            Script::Fail => Err(ConvertError::invocation_with(
                "yt-dlp exited with exit status: 1",
                "ERROR: Video unavailable",
            )),
            Script::FailAfterWrite => {
                fs::write(&output, b"partial").unwrap();
                Err(ConvertError::invocation("ffmpeg exited with exit status: 1"))
            }
            Script::Panic => panic!("converter blew up"),
        }
    }
}
