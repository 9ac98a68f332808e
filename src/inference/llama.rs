//! llama.cpp backend
//!
//! Runs GGUF models through llama-cpp-2.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaModel`, `LlamaContext`, `LlamaSampler`)
//! contain raw pointers that are not `Send`, each engine owns a dedicated
//! worker thread that loads and keeps the model. The session's thread talks
//! to it over channels and still runs the caller's callback itself, so the
//! worker never executes caller code.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use once_cell::sync::OnceCell;

use crate::config::SessionConfig;
use crate::inference::engine::{Engine, EngineError, EngineOutcome, EngineProfile, Finish, FragmentSink, StopSignal};
use crate::inference::model::inspect_model;
use crate::inference::streaming::{GenerationReport, StreamEvent, Utf8Assembler};
use crate::session::Parameters;

/// llama.cpp allows one backend per process; every engine shares it.
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

const MIN_CONTEXT: u32 = 512;

fn shared_backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        send_logs_to_tracing(LogOptions::default().with_logs_enabled(true));
        let backend = LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: PathBuf,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Settings the worker needs for one generation
#[derive(Debug, Clone)]
struct GenerateSettings {
    params: Parameters,
    seed: u32,
    context_size: u32,
    batch: u32,
    threads: Option<i32>,
    chat_template: bool,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate {
        prompt: String,
        settings: GenerateSettings,
        event_tx: Sender<StreamEvent>,
        /// Raised by `Session::stop` from any thread
        stop: StopSignal,
        /// Raised by this engine once the sink breaks
        halt: StopSignal,
    },
    TokenLength {
        text: String,
        response_tx: Sender<Result<usize, EngineError>>,
    },
    Shutdown,
}

/// Engine backed by llama-cpp-2
pub struct LlamaEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    model_info: LoadedModelInfo,
    settings: GenerateSettings,
    profile: EngineProfile,
}

impl LlamaEngine {
    /// Validates the model artifact, then loads it on a fresh worker thread.
    pub fn load(config: &SessionConfig) -> Result<Self, EngineError> {
        let artifact = inspect_model(&config.model.path)?;
        tracing::debug!(
            "GGUF v{} with {} tensors at {}",
            artifact.version,
            artifact.tensor_count,
            config.model.path.display()
        );

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path = config.model.path.clone();
        let gpu_layers = config.model.gpu_layers;

        let started = Instant::now();
        let handle = thread::Builder::new()
            .name("llama-worker".into())
            .spawn(move || worker_thread_main(path, gpu_layers, ready_tx, command_rx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let model_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(EngineError::WorkerError("worker exited while loading the model".to_string()));
            }
        };

        let profile = EngineProfile {
            backend: "llama.cpp".to_string(),
            model_load_ms: started.elapsed().as_secs_f64() * 1000.0,
            ..Default::default()
        };

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx) in {:.0} ms",
            model_info.path.display(),
            model_info.param_count,
            model_info.vocab_size,
            model_info.context_length,
            profile.model_load_ms
        );

        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            model_info,
            settings: GenerateSettings {
                params: config.parameters(),
                seed: config.sampler.seed,
                context_size: config.context.size,
                batch: config.context.batch,
                threads: config.context.threads,
                chat_template: config.chat_template,
            },
            profile,
        })
    }

    /// Returns information about the loaded model
    pub fn model_info(&self) -> &LoadedModelInfo {
        &self.model_info
    }

    fn sender(&self) -> Result<&Sender<WorkerCommand>, EngineError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("engine already shut down".to_string()))
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        match self.worker_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| EngineError::WorkerError("worker thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Engine for LlamaEngine {
    fn generate(&mut self, prompt: &str, stop: &StopSignal, sink: &mut FragmentSink<'_>) -> Result<EngineOutcome, EngineError> {
        let (event_tx, event_rx) = mpsc::channel();
        let halt = StopSignal::new();

        self.sender()?
            .send(WorkerCommand::Generate {
                prompt: prompt.to_string(),
                settings: self.settings.clone(),
                event_tx,
                stop: stop.clone(),
                halt: halt.clone(),
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let report = drain_events(&event_rx, &halt, sink)?;
        self.profile.record(
            report.prompt_tokens,
            report.generated_tokens,
            report.prompt_eval_ms,
            report.generation_ms,
        );

        Ok(EngineOutcome {
            finish: report.finish,
            prompt_tokens: report.prompt_tokens,
            generated_tokens: report.generated_tokens,
        })
    }

    fn set_params(&mut self, params: &Parameters) -> Result<(), EngineError> {
        self.settings.params = *params;
        Ok(())
    }

    fn profile(&self) -> Result<EngineProfile, EngineError> {
        Ok(self.profile.clone())
    }

    fn token_length(&self, text: &str) -> Result<usize, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.sender()?
            .send(WorkerCommand::TokenLength {
                text: text.to_string(),
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }

    fn release(&mut self) -> Result<(), EngineError> {
        self.shutdown()?;
        tracing::info!("Model released: {}", self.model_info.path.display());
        Ok(())
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("llama worker shutdown failed: {}", e);
        }
    }
}

/// Forwards worker fragments to `sink` until the worker reports the end.
///
/// Once the sink breaks, `halt` tells the worker to stop and any fragments
/// already in flight are discarded; the loop still waits for the worker's
/// final event so no generation state outlives this call.
fn drain_events(
    event_rx: &Receiver<StreamEvent>,
    halt: &StopSignal,
    sink: &mut FragmentSink<'_>,
) -> Result<GenerationReport, EngineError> {
    loop {
        match event_rx.recv() {
            Ok(StreamEvent::Fragment(text)) => {
                if halt.is_requested() {
                    continue;
                }
                if let ControlFlow::Break(()) = sink(text.as_str()) {
                    halt.request();
                }
            }
            Ok(StreamEvent::Finished(mut report)) => {
                if halt.is_requested() {
                    report.finish = Finish::Halted;
                }
                return Ok(report);
            }
            Ok(StreamEvent::Failed(message)) => return Err(EngineError::Inference(message)),
            // The generation failed; later calls see the dead worker as WorkerError
            Err(_) => return Err(EngineError::Inference("worker exited mid-generation".to_string())),
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaModel; exits on Shutdown or when the engine is dropped.
fn worker_thread_main(
    path: PathBuf,
    gpu_layers: u32,
    ready_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let loaded = shared_backend().and_then(|backend| {
        let model = load_model(backend, &path, gpu_layers)?;
        Ok((backend, model))
    });
    let (backend, model) = match loaded {
        Ok((backend, (model, info))) => {
            let _ = ready_tx.send(Ok(info));
            (backend, model)
        }
        Err(e) => {
            tracing::error!("Failed to load model {}: {}", path.display(), e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate {
                prompt,
                settings,
                event_tx,
                stop,
                halt,
            }) => {
                let event = match run_generation(backend, &model, &prompt, &settings, &event_tx, &stop, &halt) {
                    Ok(report) => StreamEvent::Finished(report),
                    Err(e) => {
                        tracing::error!("Generation failed: {}", e);
                        StreamEvent::Failed(e)
                    }
                };
                let _ = event_tx.send(event);
            }
            Ok(WorkerCommand::TokenLength { text, response_tx }) => {
                let result = model
                    .str_to_token(&text, AddBos::Never)
                    .map(|tokens| tokens.len())
                    .map_err(|e| EngineError::Tokenization(e.to_string()));
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::debug!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn load_model(backend: &LlamaBackend, path: &Path, gpu_layers: u32) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_path_buf(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };
    Ok((model, info))
}

/// Run text generation (called from worker thread)
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    settings: &GenerateSettings,
    tx: &Sender<StreamEvent>,
    stop: &StopSignal,
    halt: &StopSignal,
) -> Result<GenerationReport, String> {
    let prompt = if settings.chat_template {
        match build_chat_prompt(model, prompt) {
            Ok(chat_prompt) => chat_prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                prompt.to_string()
            }
        }
    } else {
        prompt.to_string()
    };

    let n_ctx = match settings.context_size {
        0 => model.n_ctx_train(),
        size => size.min(model.n_ctx_train()),
    }
    .max(MIN_CONTEXT);

    let mut ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(settings.batch);
    if let Some(threads) = settings.threads {
        ctx_params = ctx_params.with_n_threads(threads).with_n_threads_batch(threads);
    }

    // A fresh context per query: every query starts from an empty dialog.
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {}", e))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| format!("Failed to tokenize: {}", e))?;
    if tokens.is_empty() {
        return Err("Prompt produced no tokens".to_string());
    }
    if tokens.len() >= n_ctx as usize {
        return Err(format!(
            "Prompt of {} tokens does not fit the {} token context",
            tokens.len(),
            n_ctx
        ));
    }

    tracing::debug!("Tokenized prompt into {} tokens (n_ctx = {})", tokens.len(), n_ctx);

    run_inference(&mut ctx, model, &tokens, n_ctx, settings, tx, stop, halt)
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let user_message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[user_message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

fn build_sampler(settings: &GenerateSettings) -> LlamaSampler {
    let params = &settings.params;
    if params.temperature < 0.01 {
        // Use greedy sampling for very low temperature
        return LlamaSampler::greedy();
    }

    let seed = if settings.seed == 0 { rand_seed() } else { settings.seed };
    let mut chain = Vec::with_capacity(4);
    if params.top_k > 0 {
        chain.push(LlamaSampler::top_k(top_k_arg(params.top_k)));
    }
    chain.push(LlamaSampler::top_p(params.top_p, 1));
    chain.push(LlamaSampler::temp(params.temperature));
    chain.push(LlamaSampler::dist(seed));
    LlamaSampler::chain_simple(chain)
}

/// `top_k` as the C int llama.cpp expects, saturating.
fn top_k_arg(top_k: u32) -> i32 {
    i32::try_from(top_k).unwrap_or(i32::MAX)
}

/// Runs the inference loop
#[allow(clippy::too_many_arguments)]
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: &[LlamaToken],
    n_ctx: u32,
    settings: &GenerateSettings,
    tx: &Sender<StreamEvent>,
    stop: &StopSignal,
    halt: &StopSignal,
) -> Result<GenerationReport, String> {
    let started = Instant::now();
    let batch_size = (settings.batch as usize).max(1);
    let mut batch = LlamaBatch::new(batch_size, 1);

    // Decode the prompt in n_batch sized chunks; only the last token needs logits.
    let last = prompt_tokens.len() - 1;
    for (chunk_index, chunk) in prompt_tokens.chunks(batch_size).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let pos = chunk_index * batch_size + offset;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode prompt: {}", e))?;
    }
    let prompt_eval_ms = started.elapsed().as_secs_f64() * 1000.0;

    let generation_started = Instant::now();
    let mut sampler = build_sampler(settings);
    let mut n_cur = prompt_tokens.len() as i32;
    let mut generated: u64 = 0;
    let mut assembler = Utf8Assembler::new();
    let max_length = u64::from(settings.params.max_length);

    let finish = loop {
        if stop.is_requested() || halt.is_requested() {
            tracing::debug!("Generation halted after {} tokens", generated);
            break Finish::Halted;
        }
        if generated >= max_length {
            break Finish::MaxLength;
        }
        if n_cur as u32 >= n_ctx {
            tracing::warn!("Context window of {} tokens exhausted", n_ctx);
            break Finish::ContextFull;
        }

        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            break Finish::EndOfSequence;
        }
        generated += 1;

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;

        if let Some(text) = assembler.push(&token_bytes) {
            if tx.send(StreamEvent::Fragment(text)).is_err() {
                // Receiver dropped, stop generation
                tracing::debug!("Receiver dropped, stopping generation");
                break Finish::Halted;
            }
        }

        // Prepare batch for next iteration
        batch.clear();
        batch
            .add(new_token, n_cur, &[0], true)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode: {}", e))?;

        n_cur += 1;
    };

    if finish.is_natural() {
        if let Some(rest) = assembler.finish() {
            let _ = tx.send(StreamEvent::Fragment(rest));
        }
    }

    Ok(GenerationReport {
        finish,
        prompt_tokens: prompt_tokens.len() as u64,
        generated_tokens: generated,
        prompt_eval_ms,
        generation_ms: generation_started.elapsed().as_secs_f64() * 1000.0,
    })
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
