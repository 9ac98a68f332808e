//! Scripted engine
//!
//! A deterministic backend that replays a fixed list of fragments. Used by
//! the test suite and by callers that need the session contract without a
//! model on disk.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::inference::engine::{Engine, EngineError, EngineOutcome, EngineProfile, Finish, FragmentSink, StopSignal};
use crate::session::Parameters;

/// Shared counters observing a [`ScriptedEngine`] from outside the session.
#[derive(Debug, Clone, Default)]
pub struct EngineProbe {
    calls: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl EngineProbe {
    /// Engine operations invoked, release excluded
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Times `release` ran
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Engines created from this probe that have not been released
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Replays `fragments` on every generate call.
#[derive(Debug)]
pub struct ScriptedEngine {
    fragments: Vec<String>,
    fail_at: Option<usize>,
    delay: Duration,
    params: Parameters,
    profile: EngineProfile,
    probe: EngineProbe,
    released: bool,
}

impl ScriptedEngine {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let probe = EngineProbe::default();
        probe.live.fetch_add(1, Ordering::SeqCst);
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            fail_at: None,
            delay: Duration::ZERO,
            params: Parameters::default(),
            profile: EngineProfile {
                backend: "scripted".to_string(),
                ..Default::default()
            },
            probe,
            released: false,
        }
    }

    /// Fails with an inference error instead of producing fragment `index`.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Sleeps before producing each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Counters that stay readable after the engine moves into a session.
    pub fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }

    /// Parameters most recently applied
    pub fn params(&self) -> Parameters {
        self.params
    }

    fn touch(&self) {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl Engine for ScriptedEngine {
    fn generate(&mut self, prompt: &str, stop: &StopSignal, sink: &mut FragmentSink<'_>) -> Result<EngineOutcome, EngineError> {
        self.touch();
        let started = Instant::now();
        let prompt_tokens = prompt.split_whitespace().count() as u64;
        let limit = self.params.max_length as usize;

        let mut generated = 0u64;
        let mut finish = Finish::EndOfSequence;
        for (index, fragment) in self.fragments.iter().enumerate() {
            if index >= limit {
                finish = Finish::MaxLength;
                break;
            }
            if stop.is_requested() {
                finish = Finish::Halted;
                break;
            }
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if self.fail_at == Some(index) {
                return Err(EngineError::Inference(format!("scripted failure at fragment {index}")));
            }
            generated += 1;
            if let ControlFlow::Break(()) = sink(fragment.as_str()) {
                finish = Finish::Halted;
                break;
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.profile.record(prompt_tokens, generated, 0.0, elapsed_ms);
        Ok(EngineOutcome {
            finish,
            prompt_tokens,
            generated_tokens: generated,
        })
    }

    fn set_params(&mut self, params: &Parameters) -> Result<(), EngineError> {
        self.touch();
        self.params = *params;
        Ok(())
    }

    fn profile(&self) -> Result<EngineProfile, EngineError> {
        self.touch();
        Ok(self.profile.clone())
    }

    fn token_length(&self, text: &str) -> Result<usize, EngineError> {
        self.touch();
        Ok(text.split_whitespace().count())
    }

    fn release(&mut self) -> Result<(), EngineError> {
        if !self.released {
            self.released = true;
            self.probe.releases.fetch_add(1, Ordering::SeqCst);
            self.probe.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
