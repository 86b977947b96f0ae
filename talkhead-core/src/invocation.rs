use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{GenerateError, Mode, Result, ServiceConfig, WeightBundle};

/// Trades peak memory for speed: keep no DiT parameters resident.
pub const LOW_VRAM_ARGS: [&str; 2] = ["--num_persistent_param_in_dit", "0"];

/// Upper bound on the output kept per stream, and so on the diagnostic
/// text carried by an inference failure.
pub const DIAGNOSTIC_TAIL_BYTES: usize = 4096;

/// One fully described child process: what to run, where, and with which
/// environment overrides on top of the inherited environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Exit status plus the last [`DIAGNOSTIC_TAIL_BYTES`] of each stream.
/// Everything else went to the log as it was produced.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub status: ExitStatus,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl InvocationOutput {
    /// The tail of stderr, or of stdout when stderr is empty.
    pub fn diagnostics(&self) -> String {
        let text = if self.stderr_tail.trim().is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        };
        tail(text.trim(), DIAGNOSTIC_TAIL_BYTES).to_string()
    }
}

impl Invocation {
    /// Command line for `generate_infinitetalk.py`.
    pub fn generate(
        config: &ServiceConfig,
        input_json: &Path,
        mode: Mode,
        sample_steps: u32,
        save_file: &Path,
    ) -> Self {
        let mut args = vec![
            config.script_path().display().to_string(),
            "--ckpt_dir".to_string(),
            config.bundle_dir(WeightBundle::Wan).display().to_string(),
            "--infinitetalk_dir".to_string(),
            config.bundle_dir(WeightBundle::InfiniteTalk).display().to_string(),
            "--wav2vec_dir".to_string(),
            config.bundle_dir(WeightBundle::Wav2Vec).display().to_string(),
            "--input_json".to_string(),
            input_json.display().to_string(),
            "--mode".to_string(),
            mode.to_string(),
            "--sample_steps".to_string(),
            sample_steps.to_string(),
            "--save_file".to_string(),
            save_file.display().to_string(),
        ];
        if config.low_vram {
            args.extend(LOW_VRAM_ARGS.iter().map(|arg| arg.to_string()));
        }

        Self {
            program: config.python.clone(),
            args,
            cwd: config.code_dir.clone(),
            env: config.child_env.clone(),
        }
    }

    /// Runs the process to completion, forwarding its output to the log line
    /// by line. A non-zero exit becomes [`GenerateError::InferenceFailed`]
    /// carrying the tail of that output.
    pub async fn run(&self) -> Result<InvocationOutput> {
        info!(program = %self.program, cwd = %self.cwd.display(), "spawning generation process");
        debug!(args = ?self.args, "generation arguments");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.cwd)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The staging directory disappears with the request future.
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GenerateError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let (stdout, stderr, status) = tokio::join!(
            drain(child.stdout.take(), Stream::Stdout),
            drain(child.stderr.take(), Stream::Stderr),
            child.wait(),
        );
        let status = status.map_err(|e| GenerateError::io("waiting for generation process", e))?;
        let stdout = stdout.map_err(|e| GenerateError::io("reading child stdout", e))?;
        let stderr = stderr.map_err(|e| GenerateError::io("reading child stderr", e))?;

        let output = InvocationOutput {
            status,
            stdout_tail: stdout.into_string(),
            stderr_tail: stderr.into_string(),
        };

        if output.status.success() {
            Ok(output)
        } else {
            Err(GenerateError::inference(
                Some(output.status),
                output.diagnostics(),
            ))
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Stream {
    Stdout,
    Stderr,
}

/// Most recent lines of a stream, bounded by `DIAGNOSTIC_TAIL_BYTES`.
#[derive(Debug, Default)]
struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl OutputTail {
    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > DIAGNOSTIC_TAIL_BYTES && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
            }
        }
    }

    fn into_string(self) -> String {
        let joined = Vec::from(self.lines).join("\n");
        tail(&joined, DIAGNOSTIC_TAIL_BYTES).to_string()
    }
}

/// Reads `reader` to EOF, logging each line and keeping the tail. Both `\n`
/// and `\r` end a line so progress bars do not pile up into one.
async fn drain<R>(reader: Option<R>, stream: Stream) -> std::io::Result<OutputTail>
where
    R: AsyncRead + Unpin,
{
    let mut tail = OutputTail::default();
    let Some(reader) = reader else {
        return Ok(tail);
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        for &byte in buf {
            if byte == b'\n' || byte == b'\r' {
                emit(&mut line, stream, &mut tail);
            } else {
                line.push(byte);
                if line.len() >= DIAGNOSTIC_TAIL_BYTES {
                    emit(&mut line, stream, &mut tail);
                }
            }
        }
        reader.consume(len);
    }
    emit(&mut line, stream, &mut tail);

    Ok(tail)
}

fn emit(line: &mut Vec<u8>, stream: Stream, tail: &mut OutputTail) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end();
    if !text.is_empty() {
        match stream {
            Stream::Stdout => info!(stream = "stdout", "{text}"),
            Stream::Stderr => warn!(stream = "stderr", "{text}"),
        }
        tail.push(text);
    }
    line.clear();
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
