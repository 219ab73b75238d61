//! Completion by spawning a llama.cpp-compatible command-line binary.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use airgap_core::{Error, Result};

use crate::engine::{CompletionEngine, EngineSession, GenerationParams};

const REAP_POLL: Duration = Duration::from_millis(20);

pub struct ProcessEngine {
    name: String,
    binary: PathBuf,
    model_path: PathBuf,
}

impl ProcessEngine {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), binary: binary.into(), model_path: model_path.into() }
    }

    fn command(&self, prompt: &str, params: &GenerationParams) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-m")
            .arg(&self.model_path)
            .arg("-p")
            .arg(prompt)
            .args(["-n", &params.max_tokens.to_string()])
            .args(["-c", &params.n_ctx.to_string()])
            .args(["-b", &params.n_batch.to_string()])
            .args(["--temp", &params.temperature.to_string()])
            .args(["--top-p", &params.top_p.to_string()])
            .args(["--repeat-penalty", &params.repeat_penalty.to_string()])
            .arg("--no-display-prompt")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    fn spawn(&self, prompt: &str, params: &GenerationParams) -> Result<Child> {
        match self.command(prompt, params).spawn() {
            Ok(child) => Ok(child),
            Err(first) => {
                warn!("Failed to start {} ({first}), retrying once", self.binary.display());
                self.command(prompt, params).spawn().map_err(|e| {
                    Error::ModelUnavailable(format!("cannot start {}: {e}", self.binary.display()))
                })
            }
        }
    }
}

impl CompletionEngine for ProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, prompt: &str, params: &GenerationParams) -> Result<EngineSession> {
        if !self.model_path.is_file() {
            return Err(Error::ModelUnavailable(format!("model file not found: {}", self.model_path.display())));
        }
        let mut child = self.spawn(prompt, params)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Inference("child stdout was not captured".to_string()))?;
        debug!("Started {} for model {}", self.binary.display(), self.name);

        let child = Arc::new(Mutex::new(child));
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel = {
            let child = Arc::clone(&child);
            let cancelled = Arc::clone(&cancelled);
            Arc::new(move || {
                cancelled.store(true, Ordering::SeqCst);
                let _ = child.lock().kill();
            })
        };
        let tokens = WordTokens { stdout, child, cancelled, buf: String::new(), tail: Vec::new(), eof: false, reaped: false };
        Ok(EngineSession { tokens: Box::new(tokens), cancel })
    }
}

/// Splits child stdout into word-sized tokens, each carrying its leading whitespace.
struct WordTokens {
    stdout: ChildStdout,
    child: Arc<Mutex<Child>>,
    cancelled: Arc<AtomicBool>,
    buf: String,
    /// bytes of a UTF-8 sequence cut by the read boundary
    tail: Vec<u8>,
    eof: bool,
    reaped: bool,
}

impl WordTokens {
    /// End of the first whitespace-prefixed word, if the buffer holds a complete one.
    fn split_point(&self) -> Option<usize> {
        let mut seen_word = false;
        for (i, c) in self.buf.char_indices() {
            if c.is_whitespace() {
                if seen_word {
                    return Some(i);
                }
            } else {
                seen_word = true;
            }
        }
        None
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 512];
        let n = self.stdout.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
            let rest = std::mem::take(&mut self.tail);
            self.buf.push_str(&String::from_utf8_lossy(&rest));
            return Ok(());
        }
        self.tail.extend_from_slice(&chunk[..n]);
        let valid = match std::str::from_utf8(&self.tail) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.tail.len(),
        };
        let bytes: Vec<u8> = self.tail.drain(..valid).collect();
        self.buf.push_str(&String::from_utf8_lossy(&bytes));
        Ok(())
    }

    /// Reap the child after stdout closed. The lock is only held per poll so a
    /// canceller can always reach the child to kill it.
    fn finish(&mut self) -> Option<Result<String>> {
        let status = loop {
            let polled = self.child.lock().try_wait();
            match polled {
                Ok(Some(status)) => break status,
                Ok(None) if self.cancelled.load(Ordering::SeqCst) => {
                    let mut child = self.child.lock();
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break status,
                        Err(e) => return Some(Err(e.into())),
                    }
                }
                Ok(None) => thread::sleep(REAP_POLL),
                Err(e) => return Some(Err(e.into())),
            }
        };
        if !status.success() && !self.cancelled.load(Ordering::SeqCst) {
            return Some(Err(Error::Inference(format!("completion process exited with {status}"))));
        }
        None
    }
}

impl Iterator for WordTokens {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(at) = self.split_point() {
                let rest = self.buf.split_off(at);
                return Some(Ok(std::mem::replace(&mut self.buf, rest)));
            }
            if self.eof {
                if !self.buf.is_empty() {
                    return Some(Ok(std::mem::take(&mut self.buf)));
                }
                if self.reaped {
                    return None;
                }
                self.reaped = true;
                return self.finish();
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            if let Err(e) = self.fill() {
                self.eof = true;
                return Some(Err(e));
            }
        }
    }
}
