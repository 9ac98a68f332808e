//! Inference session
//!
//! A [`Session`] owns one engine for its whole life. It moves through
//! `Uninitialized → Ready → Released`, serializes every operation on the
//! engine behind one lock, and streams generated text to a caller-supplied
//! callback on the caller's own thread.
//!
//! The callback follows the convention of the native binding this crate
//! replaces: returning `false` continues generation, returning `true` stops
//! it.

use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigError, SessionConfig};
use crate::inference::{Engine, EngineError, Finish, StopSignal};

mod params;
mod profile;

pub use params::Parameters;
pub use profile::{ProfileSnapshot, QueryCounters};

/// Errors surfaced by session operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine failed to initialize: {0}")]
    EngineInit(String),

    #[error("Session not ready: {0}")]
    NotReady(String),

    #[error("A query is already in flight on this session")]
    SessionBusy,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Session has been released")]
    UseAfterRelease,
}

impl SessionError {
    /// Construction errors; the session never came up.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Configuration(_) | SessionError::EngineInit(_))
    }

    /// Errors after which the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Generation(_) | SessionError::SessionBusy)
    }
}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Configuration(e.to_string())
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::BackendInit(_) | EngineError::ModelLoad(_) | EngineError::ModelValidation(_) => {
                SessionError::EngineInit(e.to_string())
            }
            EngineError::WorkerError(_) => SessionError::NotReady(e.to_string()),
            EngineError::ParamsRejected(_) => SessionError::InvalidParameter(e.to_string()),
            EngineError::ContextCreate(_) | EngineError::Tokenization(_) | EngineError::Inference(_) => {
                SessionError::Generation(e.to_string())
            }
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Engine not attached yet; only observable during construction
    Uninitialized = 0,
    Ready = 1,
    /// Terminal
    Released = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Uninitialized,
            1 => SessionState::Ready,
            _ => SessionState::Released,
        }
    }
}

/// How a query ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// End of sequence, `max_length` or a full context window
    Completed,
    /// The callback returned `true`
    TerminatedByCallback,
    /// [`Session::stop`] was called while the query ran
    StoppedExternally,
    /// The engine or the callback failed; only recorded in the profile,
    /// `query` itself returns the error
    Failed,
}

struct Inner {
    engine: Option<Box<dyn Engine>>,
    params: Parameters,
    counters: QueryCounters,
}

/// A managed session over one inference engine.
///
/// All methods take `&self`; share a session across threads with `Arc`.
/// Only [`Session::stop`] and [`Session::release`] make progress while a
/// query is running; the other operations wait for it.
pub struct Session {
    id: Uuid,
    config_path: PathBuf,
    state: AtomicU8,
    busy: AtomicBool,
    stop: StopSignal,
    query_thread: Mutex<Option<ThreadId>>,
    inner: Mutex<Inner>,
}

impl Session {
    /// Loads `config_path` and starts the llama.cpp backend it describes.
    #[cfg(feature = "llama")]
    pub fn open<P: AsRef<Path>>(config_path: P) -> Result<Self, SessionError> {
        Self::open_with(config_path, crate::inference::LlamaEngine::load)
    }

    /// Loads `config_path` and builds the engine with `build`.
    pub fn open_with<P, E, F>(config_path: P, build: F) -> Result<Self, SessionError>
    where
        P: AsRef<Path>,
        E: Engine + 'static,
        F: FnOnce(&SessionConfig) -> Result<E, EngineError>,
    {
        let config = SessionConfig::load(config_path)?;
        Self::from_config(&config, build)
    }

    /// Validates `config` and builds a session from it.
    pub fn from_config<E, F>(config: &SessionConfig, build: F) -> Result<Self, SessionError>
    where
        E: Engine + 'static,
        F: FnOnce(&SessionConfig) -> Result<E, EngineError>,
    {
        config.validate()?;
        let params = config.parameters();

        let mut engine = build(config).map_err(|e| SessionError::EngineInit(e.to_string()))?;
        if let Err(e) = engine.set_params(&params) {
            let _ = engine.release();
            return Err(SessionError::EngineInit(e.to_string()));
        }

        let session = Self {
            id: Uuid::new_v4(),
            config_path: config.source.clone(),
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            busy: AtomicBool::new(false),
            stop: StopSignal::new(),
            query_thread: Mutex::new(None),
            inner: Mutex::new(Inner {
                engine: Some(Box::new(engine)),
                params,
                counters: QueryCounters::default(),
            }),
        };
        session.state.store(SessionState::Ready as u8, Ordering::Release);

        tracing::info!("Session {} ready ({})", session.id, session.config_path.display());
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration file this session was built from
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while a query is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Generates from `prompt`, handing each fragment to `callback`.
    ///
    /// The callback runs on this thread, once per fragment, in generation
    /// order. Return `true` from it to end generation early. Blocks until
    /// generation completes, the callback ends it, or [`Session::stop`] is
    /// called from another thread. Fragments delivered before a failure stay
    /// delivered.
    pub fn query<F>(&self, prompt: &str, mut callback: F) -> Result<CompletionReason, SessionError>
    where
        F: FnMut(&str) -> bool,
    {
        self.ensure_ready()?;
        let _busy = BusyGuard::enter(self)?;

        let mut guard = self.lock_engine()?;
        let Inner { engine, counters, .. } = &mut *guard;
        let Some(engine) = engine.as_deref_mut() else {
            return Err(SessionError::UseAfterRelease);
        };

        tracing::debug!("Session {} query started ({} prompt bytes)", self.id, prompt.len());
        let started = Instant::now();
        let result = drive(engine, prompt, &self.stop, &mut callback);

        match &result {
            Ok(reason) => {
                counters.record(*reason);
                tracing::info!(
                    "Session {} query finished: {:?} in {:.2}s",
                    self.id,
                    reason,
                    started.elapsed().as_secs_f32()
                );
            }
            Err(e) => {
                counters.record(CompletionReason::Failed);
                tracing::warn!("Session {} query failed: {}", self.id, e);
            }
        }

        // release() ran inside the callback and left the engine to us
        if self.state() == SessionState::Released {
            free_engine(&mut guard, self.id);
        }
        result
    }

    /// Asks the in-flight query to stop. Safe to call from any thread.
    ///
    /// Returns whether a query was running. At most the callback invocation
    /// already under way completes after this returns.
    pub fn stop(&self) -> Result<bool, SessionError> {
        self.ensure_ready()?;
        if self.signal_query().is_none() {
            return Ok(false);
        }
        tracing::debug!("Session {} stop requested", self.id);
        Ok(true)
    }

    /// Replaces the generation parameters, all four or none.
    pub fn set_params(&self, max_length: u32, temperature: f32, top_k: u32, top_p: f32) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let params = Parameters::new(max_length, temperature, top_k, top_p)?;
        self.apply_params(params)
    }

    /// String form of [`Session::set_params`].
    pub fn set_params_str(&self, max_length: &str, temperature: &str, top_k: &str, top_p: &str) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let params = Parameters::parse(max_length, temperature, top_k, top_p)?;
        self.apply_params(params)
    }

    /// Parameters applied to the next query
    pub fn params(&self) -> Result<Parameters, SessionError> {
        let guard = self.lock_idle()?;
        Ok(guard.params)
    }

    /// Copies out the engine counters and this session's query counters.
    pub fn profile(&self) -> Result<ProfileSnapshot, SessionError> {
        let guard = self.lock_idle()?;
        let engine = guard.engine.as_deref().ok_or(SessionError::UseAfterRelease)?;
        Ok(ProfileSnapshot {
            session_id: self.id,
            engine: engine.profile()?,
            queries: guard.counters.clone(),
        })
    }

    /// Number of tokens the engine encodes `text` to.
    pub fn token_length(&self, text: &str) -> Result<usize, SessionError> {
        let guard = self.lock_idle()?;
        let engine = guard.engine.as_deref().ok_or(SessionError::UseAfterRelease)?;
        Ok(engine.token_length(text)?)
    }

    /// Frees the engine. Idempotent and infallible.
    ///
    /// A running query is stopped first and this call waits for it to
    /// return, so no callback runs once `release` has returned. Called from
    /// inside the query's own callback, the engine is freed as that query
    /// returns instead.
    pub fn release(&self) {
        let previous = SessionState::from_u8(self.state.swap(SessionState::Released as u8, Ordering::AcqRel));
        if previous != SessionState::Released {
            tracing::info!("Releasing session {}", self.id);
        }

        if self.signal_query() == Some(thread::current().id()) {
            return;
        }

        let mut guard = self.inner.lock();
        free_engine(&mut guard, self.id);
    }

    fn apply_params(&self, params: Parameters) -> Result<(), SessionError> {
        let mut guard = self.lock_idle()?;
        let engine = guard.engine.as_deref_mut().ok_or(SessionError::UseAfterRelease)?;
        engine.set_params(&params)?;
        guard.params = params;
        tracing::debug!("Session {} parameters set: {:?}", self.id, params);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Released => Err(SessionError::UseAfterRelease),
            SessionState::Uninitialized => Err(SessionError::NotReady("engine not attached".to_string())),
        }
    }

    /// Raises the stop flag if a query is in flight and returns its thread.
    fn signal_query(&self) -> Option<ThreadId> {
        let query_thread = self.query_thread.lock();
        if query_thread.is_some() {
            self.stop.request();
        }
        *query_thread
    }

    fn on_query_thread(&self) -> bool {
        *self.query_thread.lock() == Some(thread::current().id())
    }

    /// Takes the session lock once the session is usable.
    fn lock_engine(&self) -> Result<MutexGuard<'_, Inner>, SessionError> {
        self.ensure_ready()?;
        let guard = self.inner.lock();
        // release() may have won the race while we waited
        self.ensure_ready()?;
        if guard.engine.is_none() {
            return Err(SessionError::UseAfterRelease);
        }
        Ok(guard)
    }

    /// Like `lock_engine`, for operations other than `query`.
    ///
    /// Called from inside a query callback these would wait on the very
    /// query that is calling them.
    fn lock_idle(&self) -> Result<MutexGuard<'_, Inner>, SessionError> {
        self.ensure_ready()?;
        if self.on_query_thread() {
            return Err(SessionError::SessionBusy);
        }
        self.lock_engine()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

/// Marks the session busy for the lifetime of one query.
///
/// Entering and leaving hold `query_thread`, as does `signal_query`, so a
/// stop either lands before the query starts (and is cleared) or reaches the
/// running query.
struct BusyGuard<'a> {
    session: &'a Session,
}

impl<'a> BusyGuard<'a> {
    fn enter(session: &'a Session) -> Result<Self, SessionError> {
        let mut query_thread = session.query_thread.lock();
        if session
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::SessionBusy);
        }
        session.stop.reset();
        *query_thread = Some(thread::current().id());
        Ok(Self { session })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut query_thread = self.session.query_thread.lock();
        *query_thread = None;
        self.session.busy.store(false, Ordering::Release);
    }
}

fn free_engine(inner: &mut Inner, id: Uuid) {
    if let Some(mut engine) = inner.engine.take() {
        if let Err(e) = engine.release() {
            tracing::warn!("Session {} engine release failed: {}", id, e);
        }
        tracing::info!("Session {} engine released", id);
    }
}

/// Runs one generation, adapting the caller's callback to the engine sink.
fn drive<F>(engine: &mut dyn Engine, prompt: &str, stop: &StopSignal, callback: &mut F) -> Result<CompletionReason, SessionError>
where
    F: FnMut(&str) -> bool,
{
    let mut terminated = false;
    let mut panicked: Option<String> = None;
    let mut delivered = 0usize;

    let outcome = {
        let mut sink = |fragment: &str| -> ControlFlow<()> {
            if fragment.is_empty() {
                return ControlFlow::Continue(());
            }
            if stop.is_requested() {
                return ControlFlow::Break(());
            }
            delivered += 1;
            tracing::trace!("fragment {}: {:?}", delivered, fragment);
            match panic::catch_unwind(AssertUnwindSafe(|| callback(fragment))) {
                Ok(false) => ControlFlow::Continue(()),
                Ok(true) => {
                    terminated = true;
                    ControlFlow::Break(())
                }
                Err(payload) => {
                    panicked = Some(panic_message(payload.as_ref()));
                    ControlFlow::Break(())
                }
            }
        };
        engine.generate(prompt, stop, &mut sink)
    };

    if let Some(message) = panicked {
        return Err(SessionError::Generation(format!("callback panicked: {message}")));
    }
    let outcome = outcome?;

    tracing::debug!(
        "{} fragments delivered, {} tokens generated, finish {:?}",
        delivered,
        outcome.generated_tokens,
        outcome.finish
    );

    Ok(if terminated {
        CompletionReason::TerminatedByCallback
    } else if outcome.finish == Finish::Halted {
        CompletionReason::StoppedExternally
    } else {
        CompletionReason::Completed
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests;
