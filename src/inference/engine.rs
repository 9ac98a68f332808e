//! Engine capability
//!
//! Every inference backend implements [`Engine`]. A session owns exactly one
//! boxed engine and drives it through this trait, which lets tests swap the
//! llama.cpp backend for a scripted one.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::model::ModelError;
use crate::session::Parameters;

/// Errors that can occur inside an engine backend
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Parameters rejected: {0}")]
    ParamsRejected(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Receives each fragment; `Break` asks the engine to halt.
pub type FragmentSink<'a> = dyn FnMut(&str) -> ControlFlow<()> + 'a;

/// Cross-thread cancellation flag observed at fragment boundaries.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why an engine stopped producing fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finish {
    /// The model emitted an end-of-generation token
    EndOfSequence,
    /// `max_length` tokens were generated
    MaxLength,
    /// The context window is full
    ContextFull,
    /// The stop signal or the sink ended generation early
    Halted,
}

impl Finish {
    /// True for the endings that count as natural completion
    pub fn is_natural(self) -> bool {
        !matches!(self, Finish::Halted)
    }
}

/// Result of one successful `generate` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOutcome {
    pub finish: Finish,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
}

/// Timing and usage counters owned by an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineProfile {
    /// Backend name, e.g. "llama.cpp"
    pub backend: String,
    /// Time spent loading the model
    pub model_load_ms: f64,
    /// Completed generate calls (any finish, excluding failures)
    pub generations: u64,
    /// Cumulative prompt tokens evaluated
    pub prompt_tokens: u64,
    /// Cumulative tokens generated
    pub generated_tokens: u64,
    /// Prompt evaluation time of the last generation
    pub last_prompt_eval_ms: f64,
    /// Token generation time of the last generation
    pub last_generation_ms: f64,
    /// Generation throughput of the last generation
    pub last_tokens_per_second: f64,
}

impl EngineProfile {
    /// Folds the counters of one finished generation into the profile.
    pub fn record(&mut self, prompt_tokens: u64, generated_tokens: u64, prompt_eval_ms: f64, generation_ms: f64) {
        self.generations += 1;
        self.prompt_tokens += prompt_tokens;
        self.generated_tokens += generated_tokens;
        self.last_prompt_eval_ms = prompt_eval_ms;
        self.last_generation_ms = generation_ms;
        self.last_tokens_per_second = if generation_ms > 0.0 {
            generated_tokens as f64 / (generation_ms / 1000.0)
        } else {
            0.0
        };
    }
}

/// An inference backend bound to one model.
///
/// Implementations are driven by a single session, one call at a time. The
/// only cross-thread interaction is the [`StopSignal`] passed to
/// [`Engine::generate`], which another thread may raise at any moment.
pub trait Engine: Send {
    /// Generates from `prompt`, handing each fragment to `sink` in order.
    ///
    /// Must check `stop` before producing each fragment and return
    /// [`Finish::Halted`] once it is raised or `sink` returns `Break`.
    /// Generation state is torn down before this returns, on every path.
    fn generate(&mut self, prompt: &str, stop: &StopSignal, sink: &mut FragmentSink<'_>) -> Result<EngineOutcome, EngineError>;

    /// Applies already-validated parameters to later generations.
    fn set_params(&mut self, params: &Parameters) -> Result<(), EngineError>;

    /// Copies out the engine's counters.
    fn profile(&self) -> Result<EngineProfile, EngineError>;

    /// Number of tokens `text` encodes to, without generating.
    fn token_length(&self, text: &str) -> Result<usize, EngineError>;

    /// Frees backend resources. Called exactly once by the owning session.
    fn release(&mut self) -> Result<(), EngineError>;
}
