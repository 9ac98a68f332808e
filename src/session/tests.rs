use super::*;
use std::fs;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::inference::{EngineProbe, ScriptedEngine};

/// Writes a config plus a placeholder model file into a fresh directory.
fn fixture() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("model.gguf"), b"placeholder").unwrap();
    let path = dir.path().join("genie_config.json");
    fs::write(
        &path,
        r#"{
            "model": { "path": "model.gguf" },
            "sampler": { "max_length": 64, "temp": 0.7, "top_k": 40, "top_p": 0.9 }
        }"#,
    )
    .unwrap();
    (dir, path)
}

fn open(engine: ScriptedEngine) -> (TempDir, Session, EngineProbe) {
    let (dir, path) = fixture();
    let probe = engine.probe();
    let session = Session::open_with(&path, move |_| Ok(engine)).unwrap();
    (dir, session, probe)
}

fn words(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("w{i} ")).collect()
}

/// Spins until `counter` reaches `target`, failing after a few seconds.
fn wait_for(counter: &AtomicUsize, target: usize) {
    for _ in 0..500 {
        if counter.load(Ordering::SeqCst) >= target {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {target} callbacks");
}

#[test]
fn test_query_completes_with_fragments_in_order() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["Hello", ",", " world", "!"]));
    assert_eq!(session.state(), SessionState::Ready);

    let mut seen = Vec::new();
    let reason = session
        .query("hello", |fragment| {
            seen.push(fragment.to_string());
            false
        })
        .unwrap();

    assert_eq!(reason, CompletionReason::Completed);
    assert_eq!(seen, ["Hello", ",", " world", "!"]);
    assert!(seen.iter().all(|f| !f.is_empty()));
}

#[test]
fn test_empty_fragments_are_not_delivered() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "", "b"]));

    let mut seen = Vec::new();
    session
        .query("hi", |fragment| {
            seen.push(fragment.to_string());
            false
        })
        .unwrap();
    assert_eq!(seen, ["a", "b"]);
}

#[test]
fn test_callback_returning_true_terminates() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["one", "two", "three"]));

    let mut calls = 0;
    let reason = session
        .query("hello", |_| {
            calls += 1;
            true
        })
        .unwrap();

    assert_eq!(reason, CompletionReason::TerminatedByCallback);
    assert_eq!(calls, 1);
}

#[test]
fn test_stop_from_another_thread() {
    let engine = ScriptedEngine::new(words(500)).with_delay(Duration::from_millis(5));
    let (_dir, session, _probe) = open(engine);
    let session = Arc::new(session);
    session.set_params(1000, 0.7, 40, 0.9).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = {
        let session = Arc::clone(&session);
        let calls = Arc::clone(&calls);
        thread::spawn(move || {
            session.query("hello", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            })
        })
    };

    wait_for(&calls, 3);
    assert!(session.stop().unwrap());
    let after_stop = calls.load(Ordering::SeqCst);

    let reason = worker.join().unwrap().unwrap();
    assert_eq!(reason, CompletionReason::StoppedExternally);
    assert!(calls.load(Ordering::SeqCst) <= after_stop + 1);
    assert!(calls.load(Ordering::SeqCst) < 500);
}

#[test]
fn test_stop_when_idle_has_no_effect() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "b"]));

    assert!(!session.stop().unwrap());
    let reason = session.query("hi", |_| false).unwrap();
    assert_eq!(reason, CompletionReason::Completed);
}

#[test]
fn test_stop_does_not_leak_into_next_query() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "b", "c"]));

    let first = session
        .query("hi", |_| {
            session.stop().unwrap();
            false
        })
        .unwrap();
    assert_eq!(first, CompletionReason::StoppedExternally);

    let second = session.query("hi", |_| false).unwrap();
    assert_eq!(second, CompletionReason::Completed);
}

#[test]
fn test_stop_right_after_query_starts() {
    let engine = ScriptedEngine::new(words(40)).with_delay(Duration::from_millis(2));
    let (_dir, session, _probe) = open(engine);
    let session = Arc::new(session);

    for _ in 0..20 {
        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.query("hello", |_| false))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.is_busy() {
            assert!(Instant::now() < deadline, "query never started");
            thread::yield_now();
        }
        assert!(session.stop().unwrap());
        assert_eq!(worker.join().unwrap().unwrap(), CompletionReason::StoppedExternally);
    }
}

#[test]
fn test_concurrent_query_is_busy() {
    let engine = ScriptedEngine::new(words(500)).with_delay(Duration::from_millis(5));
    let (_dir, session, _probe) = open(engine);
    let session = Arc::new(session);
    session.set_params(1000, 0.7, 40, 0.9).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = {
        let session = Arc::clone(&session);
        let calls = Arc::clone(&calls);
        thread::spawn(move || {
            session.query("hello", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            })
        })
    };

    wait_for(&calls, 1);
    assert_eq!(session.query("again", |_| false), Err(SessionError::SessionBusy));

    session.stop().unwrap();
    assert_eq!(worker.join().unwrap().unwrap(), CompletionReason::StoppedExternally);
    assert_eq!(session.query("again", |_| true).unwrap(), CompletionReason::TerminatedByCallback);
}

#[test]
fn test_reentrant_calls_from_callback_are_busy() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "b"]));

    let mut nested = Vec::new();
    session
        .query("hi", |_| {
            nested.push(session.query("inner", |_| false).err());
            nested.push(session.profile().err());
            nested.push(session.token_length("x").err());
            nested.push(session.set_params(8, 0.5, 10, 0.5).err());
            true
        })
        .unwrap();

    assert_eq!(nested, vec![Some(SessionError::SessionBusy); 4]);
}

#[test]
fn test_set_params_rejects_zero_max_length() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a"]));
    let before = session.params().unwrap();

    let result = session.set_params(0, 0.7, 40, 0.9);
    assert!(matches!(result, Err(SessionError::InvalidParameter(_))));

    assert!(session.profile().is_ok());
    assert_eq!(session.params().unwrap(), before);
}

#[test]
fn test_set_params_is_all_or_nothing() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a"]));

    session.set_params(128, 0.5, 10, 0.5).unwrap();
    let applied = Parameters::new(128, 0.5, 10, 0.5).unwrap();
    assert_eq!(session.params().unwrap(), applied);

    assert!(session.set_params(256, 0.9, 20, 1.5).is_err());
    assert!(session.set_params(256, -1.0, 20, 0.5).is_err());
    assert!(session.set_params_str("256", "0.9", "twenty", "0.5").is_err());
    assert_eq!(session.params().unwrap(), applied);

    session.set_params_str("32", "0", "0", "1").unwrap();
    assert_eq!(session.params().unwrap(), Parameters::new(32, 0.0, 0, 1.0).unwrap());
}

#[test]
fn test_initial_params_come_from_config() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a"]));
    assert_eq!(session.params().unwrap(), Parameters::new(64, 0.7, 40, 0.9).unwrap());
}

#[test]
fn test_max_length_bounds_generation() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "b", "c", "d"]));
    session.set_params(2, 0.7, 40, 0.9).unwrap();

    let mut seen = Vec::new();
    let reason = session
        .query("hi", |f| {
            seen.push(f.to_string());
            false
        })
        .unwrap();

    assert_eq!(reason, CompletionReason::Completed);
    assert_eq!(seen, ["a", "b"]);
}

#[test]
fn test_engine_failure_keeps_session_usable() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "b", "c"]).failing_at(2));

    let mut seen = Vec::new();
    let result = session.query("hi", |f| {
        seen.push(f.to_string());
        false
    });

    let err = result.unwrap_err();
    assert!(matches!(err, SessionError::Generation(_)));
    assert!(err.is_retryable());
    assert_eq!(seen, ["a", "b"]);
    assert_eq!(session.state(), SessionState::Ready);

    let profile = session.profile().unwrap();
    assert_eq!(profile.queries.failed, 1);
    assert_eq!(profile.queries.last_completion, Some(CompletionReason::Failed));
}

#[test]
fn test_callback_panic_becomes_generation_error() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "b", "c"]));

    let mut calls = 0;
    let result = session.query("hi", |_| {
        calls += 1;
        if calls == 2 {
            panic!("callback blew up");
        }
        false
    });

    match result {
        Err(SessionError::Generation(message)) => assert!(message.contains("callback blew up")),
        other => panic!("expected generation error, got {other:?}"),
    }
    assert_eq!(calls, 2);
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!session.is_busy());
    assert_eq!(session.query("hi", |_| false).unwrap(), CompletionReason::Completed);
}

#[test]
fn test_missing_config_fails_construction() {
    let mut built = false;
    let result = Session::open_with("/this/config/does/not/exist.json", |_| {
        built = true;
        Ok(ScriptedEngine::new(["a"]))
    });

    let err = result.err().unwrap();
    assert!(matches!(err, SessionError::Configuration(_)));
    assert!(err.is_fatal());
    assert!(!built);
}

#[test]
fn test_from_config_rejects_invalid_config() {
    let missing_model = SessionConfig::from_json(r#"{ "model": { "path": "/this/model/does/not/exist.gguf" } }"#).unwrap();
    let mut built = false;
    let result = Session::from_config(&missing_model, |_| {
        built = true;
        Ok(ScriptedEngine::new(["a"]))
    });
    assert!(matches!(result.err(), Some(SessionError::Configuration(_))));
    assert!(!built);

    let (dir, _path) = fixture();
    let mut zero_batch =
        SessionConfig::from_json(r#"{ "model": { "path": "model.gguf" }, "context": { "batch": 0 } }"#).unwrap();
    zero_batch.model.path = dir.path().join("model.gguf");
    let result = Session::from_config(&zero_batch, |_| Ok(ScriptedEngine::new(["a"])));
    assert!(matches!(result.err(), Some(SessionError::Configuration(_))));

    zero_batch.context.batch = 16;
    assert!(Session::from_config(&zero_batch, |_| Ok(ScriptedEngine::new(["a"]))).is_ok());
}

#[test]
fn test_engine_failure_fails_construction() {
    let (_dir, path) = fixture();
    let result = Session::open_with(&path, |_| -> Result<ScriptedEngine, EngineError> {
        Err(EngineError::ModelLoad("incompatible model artifact".to_string()))
    });

    assert!(matches!(result.err(), Some(SessionError::EngineInit(_))));
}

#[test]
fn test_release_twice_is_noop() {
    let (_dir, session, probe) = open(ScriptedEngine::new(["a"]));

    session.release();
    session.release();

    assert_eq!(session.state(), SessionState::Released);
    assert_eq!(probe.releases(), 1);
    drop(session);
    assert_eq!(probe.releases(), 1);
}

#[test]
fn test_drop_releases_engine() {
    let (_dir, session, probe) = open(ScriptedEngine::new(["a"]));
    assert_eq!(probe.live(), 1);

    drop(session);
    assert_eq!(probe.live(), 0);
    assert_eq!(probe.releases(), 1);
}

#[test]
fn test_released_session_rejects_everything() {
    let (_dir, session, probe) = open(ScriptedEngine::new(["a"]));
    session.release();
    let calls = probe.calls();

    let mut invoked = false;
    assert_eq!(
        session.query("hi", |_| {
            invoked = true;
            false
        }),
        Err(SessionError::UseAfterRelease)
    );
    assert_eq!(session.stop(), Err(SessionError::UseAfterRelease));
    assert_eq!(session.set_params(8, 0.5, 10, 0.5), Err(SessionError::UseAfterRelease));
    assert_eq!(session.set_params(0, 0.5, 10, 0.5), Err(SessionError::UseAfterRelease));
    assert_eq!(session.params(), Err(SessionError::UseAfterRelease));
    assert_eq!(session.profile().err(), Some(SessionError::UseAfterRelease));
    assert_eq!(session.token_length("x"), Err(SessionError::UseAfterRelease));

    assert!(!invoked);
    assert_eq!(probe.calls(), calls);
}

#[test]
fn test_release_during_query_waits_for_quiesce() {
    let engine = ScriptedEngine::new(words(500)).with_delay(Duration::from_millis(5));
    let (_dir, session, probe) = open(engine);
    let session = Arc::new(session);
    session.set_params(1000, 0.7, 40, 0.9).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = {
        let session = Arc::clone(&session);
        let calls = Arc::clone(&calls);
        thread::spawn(move || {
            session.query("hello", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            })
        })
    };

    wait_for(&calls, 2);
    session.release();
    let at_release = calls.load(Ordering::SeqCst);

    assert_eq!(probe.releases(), 1);
    assert_eq!(probe.live(), 0);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(calls.load(Ordering::SeqCst), at_release);

    assert_eq!(worker.join().unwrap().unwrap(), CompletionReason::StoppedExternally);
    assert_eq!(session.state(), SessionState::Released);
}

#[test]
fn test_release_from_inside_callback() {
    let (_dir, session, probe) = open(ScriptedEngine::new(["a", "b", "c"]));

    let mut calls = 0;
    let mut nested = Vec::new();
    let reason = session
        .query("hi", |_| {
            calls += 1;
            session.release();
            nested.push(session.profile().err());
            nested.push(session.token_length("x").err());
            nested.push(session.params().err());
            nested.push(session.set_params(8, 0.5, 10, 0.5).err());
            nested.push(session.stop().err());
            nested.push(session.query("inner", |_| false).err());
            false
        })
        .unwrap();

    assert_eq!(reason, CompletionReason::StoppedExternally);
    assert_eq!(calls, 1);
    assert_eq!(nested, vec![Some(SessionError::UseAfterRelease); 6]);
    assert_eq!(session.state(), SessionState::Released);
    assert_eq!(probe.releases(), 1);
    assert_eq!(session.query("hi", |_| false), Err(SessionError::UseAfterRelease));
}

#[test]
fn test_concurrent_release_frees_once() {
    let (_dir, session, probe) = open(ScriptedEngine::new(["a"]));
    let session = Arc::new(session);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                session.release();
                let _ = session.stop();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(session.state(), SessionState::Released);
    assert_eq!(probe.releases(), 1);
}

#[test]
fn test_profile_and_token_length() {
    let (_dir, session, _probe) = open(ScriptedEngine::new(["a", "b", "c"]));

    assert_eq!(session.token_length("three short words").unwrap(), 3);

    session.query("one two", |_| false).unwrap();
    session.query("one two", |_| true).unwrap();

    let profile = session.profile().unwrap();
    assert_eq!(profile.session_id, session.id());
    assert_eq!(profile.engine.backend, "scripted");
    assert_eq!(profile.engine.generations, 2);
    assert_eq!(profile.engine.prompt_tokens, 4);
    assert_eq!(profile.engine.generated_tokens, 4);
    assert_eq!(profile.queries.completed, 1);
    assert_eq!(profile.queries.terminated_by_callback, 1);
    assert_eq!(profile.queries.last_completion, Some(CompletionReason::TerminatedByCallback));
    assert!(profile.to_json().unwrap().contains("terminated_by_callback"));
}

#[test]
fn test_config_path_is_kept() {
    let (_dir, path) = fixture();
    let session = Session::open_with(&path, |_| Ok(ScriptedEngine::new(["a"]))).unwrap();
    assert_eq!(session.config_path(), path.as_path());
}

#[test]
fn test_engine_error_mapping() {
    assert!(matches!(
        SessionError::from(EngineError::ModelValidation("bad magic".into())),
        SessionError::EngineInit(_)
    ));
    assert!(matches!(
        SessionError::from(EngineError::WorkerError("gone".into())),
        SessionError::NotReady(_)
    ));
    assert!(matches!(
        SessionError::from(EngineError::ParamsRejected("top_k".into())),
        SessionError::InvalidParameter(_)
    ));
    assert!(matches!(
        SessionError::from(EngineError::Inference("decode".into())),
        SessionError::Generation(_)
    ));
}

#[cfg(feature = "llama")]
#[test]
fn test_open_missing_config() {
    let result = Session::open("/this/config/does/not/exist.json");
    assert!(matches!(result.err(), Some(SessionError::Configuration(_))));
}
