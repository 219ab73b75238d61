/// Cuts a token stream at the first stop sequence.
///
/// Text that could still turn into a stop sequence is held back until the
/// next token settles it, so no part of a stop marker is ever emitted.
#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
    stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopStep {
    pub emit: String,
    pub stopped: bool,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self { stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(), ..Default::default() }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn push(&mut self, token: &str) -> StopStep {
        if self.stopped {
            return StopStep { emit: String::new(), stopped: true };
        }
        self.pending.push_str(token);

        if let Some(at) = self.stops.iter().filter_map(|s| self.pending.find(s.as_str())).min() {
            self.stopped = true;
            let emit = self.pending[..at].to_string();
            self.pending.clear();
            return StopStep { emit, stopped: true };
        }

        let hold = self.held_suffix_start();
        let emit = self.pending[..hold].to_string();
        self.pending.drain(..hold);
        StopStep { emit, stopped: false }
    }

    /// Release whatever was held back once the stream has ended.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Byte offset of the longest suffix of `pending` that begins some stop sequence.
    fn held_suffix_start(&self) -> usize {
        self.pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &self.pending[i..];
                self.stops.iter().any(|s| s.starts_with(tail))
            })
            .unwrap_or(self.pending.len())
    }
}
