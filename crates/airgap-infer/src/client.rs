use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use airgap_core::config::GenerationSettings;
use airgap_core::{Error, Result};

use crate::engine::{Canceller, CompletionEngine, GenerationParams};
use crate::stop::StopMatcher;

/// Tokens buffered between the engine worker and the consumer.
const CHANNEL_BOUND: usize = 32;

/// Marks the client busy for as long as it lives.
struct SessionSlot(Arc<AtomicBool>);

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-session streaming front end over a [`CompletionEngine`].
pub struct InferenceClient {
    engine: Arc<dyn CompletionEngine>,
    settings: GenerationSettings,
    active: Arc<AtomicBool>,
}

impl InferenceClient {
    pub fn new(engine: Arc<dyn CompletionEngine>, settings: GenerationSettings) -> Self {
        Self { engine, settings, active: Arc::new(AtomicBool::new(false)) }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Configured sampling parameters with the output budget fitted to `prompt`.
    pub fn params_for(&self, prompt: &str) -> GenerationParams {
        GenerationParams::for_prompt(&self.settings, prompt)
    }

    /// Start streaming a completion of `prompt`.
    ///
    /// Fails with [`Error::Busy`] while another stream from this client is alive.
    pub fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream> {
        if self.active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(Error::Busy);
        }
        let slot = SessionSlot(Arc::clone(&self.active));

        let session = self.engine.start(prompt, params)?;
        let cancel = session.cancel;
        let tokens = session.tokens;
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel::<Result<String>>(CHANNEL_BOUND);

        let worker = {
            let stop_flag = Arc::clone(&stop_flag);
            thread::Builder::new().name("airgap-infer".to_string()).spawn(move || {
                for item in tokens {
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let failed = item.is_err();
                    if tx.send(item).is_err() || failed {
                        break;
                    }
                }
            })
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                cancel();
                return Err(e.into());
            }
        };
        debug!("Generation started on {} (max_tokens={})", self.engine.name(), params.max_tokens);

        Ok(TokenStream {
            rx: Some(rx),
            worker: Some(worker),
            cancel,
            stop_flag,
            slot: Some(slot),
            stops: StopMatcher::new(&params.stop),
            timeout: Duration::from_secs(self.settings.token_timeout_secs),
            done: false,
            engine: self.engine.name().to_string(),
            started: Instant::now(),
            produced: 0,
        })
    }
}

/// Pull-based stream of generated text.
///
/// Ends at the engine's end of output, at a stop sequence, after the first
/// error, or after a token timeout. Dropping the stream aborts the session.
pub struct TokenStream {
    rx: Option<Receiver<Result<String>>>,
    worker: Option<JoinHandle<()>>,
    cancel: Canceller,
    stop_flag: Arc<AtomicBool>,
    slot: Option<SessionSlot>,
    stops: StopMatcher,
    timeout: Duration,
    done: bool,
    engine: String,
    started: Instant,
    produced: usize,
}

impl TokenStream {
    pub fn tokens_received(&self) -> usize {
        self.produced
    }

    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Cancel the session and release the client. Tokens already yielded stay valid.
    pub fn abort(&mut self) {
        if self.slot.is_some() {
            debug!("Aborting generation on {}", self.engine);
        }
        self.finish(true);
    }

    fn finish(&mut self, cancel: bool) {
        self.done = true;
        if self.slot.is_none() {
            return;
        }
        if cancel {
            self.stop_flag.store(true, Ordering::Release);
            (self.cancel)();
        }
        self.rx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Generation worker for {} panicked", self.engine);
            }
        }
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            info!(
                "Generated {} tokens in {:.2} seconds ({:.2} tokens/sec)",
                self.produced,
                secs,
                self.produced as f64 / secs
            );
        }
        self.slot = None;
    }
}

fn non_empty(text: String) -> Option<Result<String>> {
    (!text.is_empty()).then_some(Ok(text))
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let received = match &self.rx {
                Some(rx) => rx.recv_timeout(self.timeout),
                None => Err(RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Ok(token)) => {
                    self.produced += 1;
                    let step = self.stops.push(&token);
                    if step.stopped {
                        debug!("Stop sequence reached after {} tokens", self.produced);
                        self.finish(true);
                        return non_empty(step.emit);
                    }
                    if !step.emit.is_empty() {
                        return Some(Ok(step.emit));
                    }
                }
                Ok(Err(e)) => {
                    self.finish(true);
                    return Some(Err(e));
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("No token from {} within {:?}, aborting", self.engine, self.timeout);
                    self.finish(true);
                    return Some(Err(Error::InferenceTimeout(self.timeout)));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let rest = self.stops.finish();
                    self.finish(false);
                    return non_empty(rest);
                }
            }
        }
    }
}

impl std::iter::FusedIterator for TokenStream {}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.abort();
    }
}
