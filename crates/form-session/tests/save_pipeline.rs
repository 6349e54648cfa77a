//! Integration tests: edits → debounce → save → backend, plus locking.

mod common;

use common::MemoryBackend;
use form_core::{Diagnostics, DiffMap, LayoutSet, MemorySink, RuleConnection};
use form_session::{
    BackendError, FormDataStore, FormSession, PutFormDataResponse, SaveError, SaveGate,
    SaveOutcome, SessionConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn session_with(
    data: Value,
    config: SessionConfig,
) -> (FormSession<MemoryBackend>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new(data.clone()));
    let session = FormSession::new(
        config,
        Arc::clone(&backend),
        LayoutSet::new(),
        data,
        Diagnostics::new(Arc::new(MemorySink::new())),
    );
    (session, backend)
}

fn session(data: Value) -> (FormSession<MemoryBackend>, Arc<MemoryBackend>) {
    session_with(data, SessionConfig::default())
}

// ─── Saving ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn debounced_edit_is_saved_with_previous_values() {
    let (session, backend) = session(json!({"a": {"b": 1}}));
    session.set_leaf_value("a.b", json!(2));
    assert_eq!(session.save().await.unwrap(), SaveOutcome::NothingToSave);

    session.store().debounce(&[]);
    assert_eq!(session.store().debounced(), &json!({"a": {"b": 2}}));
    assert_eq!(session.save().await.unwrap(), SaveOutcome::Saved);

    let put = backend.last_put().unwrap();
    assert_eq!(put.data_model, json!({"a": {"b": 2}}));
    assert_eq!(put.previous_values, DiffMap::from([("a.b".to_string(), json!(1))]));
    assert_eq!(session.store().last_saved(), &json!({"a": {"b": 2}}));
    assert_eq!(session.save().await.unwrap(), SaveOutcome::NothingToSave);
}

#[tokio::test]
async fn redirect_body_is_applied_like_a_success() {
    let (session, backend) = session(json!({"a": {"b": 1}}));
    backend.respond(Err(BackendError::Redirect {
        url: "/data".to_string(),
        body: json!({"changedFields": {"a": {"b": 5}}}),
    }));
    session.set_leaf_value("a.b", json!(2));
    session.request_manual_save();

    assert_eq!(session.save().await.unwrap(), SaveOutcome::Redirected);
    assert_eq!(session.store().last_saved(), &json!({"a": {"b": 5}}));
    assert_eq!(session.store().current(), &json!({"a": {"b": 5}}));
    assert!(!session.store().has_unsaved_changes());
}

#[tokio::test]
async fn server_changed_fields_are_adopted() {
    let (session, backend) = session(json!({"price": 10}));
    backend.respond(Ok(PutFormDataResponse {
        changed_fields: Some(json!({"total": 12.5})),
    }));
    session.set_leaf_value("price", json!(11));
    session.request_manual_save();
    session.save().await.unwrap();
    assert_eq!(session.store().current(), &json!({"price": 11, "total": 12.5}));
}

#[tokio::test]
async fn failed_save_surfaces_and_is_retried() {
    let (session, backend) = session(json!({}));
    backend.respond(Err(BackendError::Status {
        url: "/data".to_string(),
        status: 500,
    }));
    session.set_leaf_value("x", json!("v"));
    session.request_manual_save();

    let err = session.save().await.unwrap_err();
    assert!(matches!(err, SaveError::Backend(BackendError::Status { status: 500, .. })));
    assert!(!session.store().is_saving());
    assert!(session.store().has_unsaved_changes());

    assert_eq!(session.save().await.unwrap(), SaveOutcome::Saved);
    assert_eq!(backend.put_count(), 2);
    assert!(!session.store().has_unsaved_changes());
}

#[tokio::test]
async fn only_one_save_in_flight() {
    let (session, backend) = session(json!({}));
    backend.hold_saves.store(true, Ordering::SeqCst);
    session.set_leaf_value("x", json!(1));
    session.request_manual_save();

    let (first, second) = tokio::join!(session.save(), async {
        tokio::task::yield_now().await;
        let second = session.save().await;
        backend.release.notify_one();
        second
    });
    assert_eq!(first.unwrap(), SaveOutcome::Saved);
    assert_eq!(second.unwrap(), SaveOutcome::NothingToSave);
    assert_eq!(backend.put_count(), 1);
}

#[tokio::test]
async fn rules_run_before_the_save() {
    let (session, backend) = session(json!({"a": 2, "b": 3}));
    let session = session.with_rules(vec![RuleConnection {
        output: "product".to_string(),
        expression: json!(["multiply", ["dataModel", "a"], ["dataModel", "b"]]),
    }]);
    session.set_leaf_value("b", json!(4));
    session.request_manual_save();
    session.save().await.unwrap();
    assert_eq!(
        backend.last_put().unwrap().data_model,
        json!({"a": 2, "b": 4, "product": 8})
    );
}

#[tokio::test]
async fn gatekeeper_holds_saves_until_it_allows_them() {
    let ready = Arc::new(AtomicBool::new(false));
    let (session, backend) = session(json!({}));
    let gate = Arc::clone(&ready);
    let session = session.with_gatekeeper(move |_: &FormDataStore| {
        if gate.load(Ordering::SeqCst) {
            SaveGate::Allow
        } else {
            SaveGate::Delay
        }
    });
    session.set_leaf_value("x", json!(1));
    session.request_manual_save();
    assert_eq!(session.save().await.unwrap(), SaveOutcome::NothingToSave);
    assert_eq!(backend.put_count(), 0);

    ready.store(true, Ordering::SeqCst);
    assert_eq!(session.save().await.unwrap(), SaveOutcome::Saved);
    assert_eq!(backend.last_put().unwrap().data_model, json!({"x": 1}));
}

#[tokio::test]
async fn teardown_flushes_unsaved_edits() {
    let (session, backend) = session(json!({}));
    assert_eq!(session.teardown().await.unwrap(), SaveOutcome::NothingToSave);
    session.set_leaf_value("x", json!("typed"));
    assert_eq!(session.teardown().await.unwrap(), SaveOutcome::Saved);
    assert_eq!(backend.last_put().unwrap().data_model, json!({"x": "typed"}));
}

#[tokio::test]
async fn autosave_loop_saves_after_the_debounce_window() {
    let config = SessionConfig {
        debounce_timeout_ms: 10,
        ..SessionConfig::default()
    };
    let (session, backend) = session_with(json!({}), config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();

    tokio::join!(session.run_autosave(shutdown_rx, errors_tx), async {
        session.set_leaf_value("x", json!(1));
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
    });

    assert_eq!(backend.put_count(), 1);
    assert_eq!(session.store().last_saved(), &json!({"x": 1}));
    assert!(errors_rx.try_recv().is_err());
}

#[tokio::test]
async fn start_fetches_initial_data() {
    let backend = Arc::new(MemoryBackend::new(json!({"prefilled": true})));
    let session = FormSession::start(
        SessionConfig::default(),
        backend,
        LayoutSet::new(),
        Diagnostics::default(),
    )
    .await
    .unwrap();
    assert_eq!(session.store().current(), &json!({"prefilled": true}));
    assert!(!session.store().has_unsaved_changes());
}

// ─── Locking ────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_locker_is_refused() {
    let (session, _backend) = session(json!({}));
    assert!(session.lock("x").await);
    assert!(!session.lock("y").await);
    assert_eq!(session.store().locked_by(), Some("x"));
}

#[tokio::test]
async fn lock_waits_for_unsaved_changes_to_be_saved() {
    let (session, backend) = session(json!({"a": 1}));
    backend.hold_saves.store(true, Ordering::SeqCst);
    session.set_leaf_value("a", json!(2));

    let (locked, _) = tokio::join!(session.lock("saver1"), async {
        tokio::task::yield_now().await;
        assert_eq!(backend.put_count(), 0, "save still in flight");
        assert!(!session.lock("other").await);
        assert_eq!(session.store().locked_by(), None);
        backend.release.notify_one();
    });

    assert!(locked);
    assert_eq!(session.store().locked_by(), Some("saver1"));
    assert_eq!(backend.put_count(), 1);
    assert_eq!(backend.last_put().unwrap().data_model, json!({"a": 2}));
}

#[tokio::test]
async fn lock_fails_when_the_flush_fails() {
    let (session, backend) = session(json!({}));
    backend.respond(Err(BackendError::Transport {
        url: "/data".to_string(),
        message: "connection reset".to_string(),
    }));
    session.set_leaf_value("a", json!(1));
    assert!(!session.lock("saver1").await);
    assert_eq!(session.store().locked_by(), None);
}

#[tokio::test]
async fn locked_session_does_not_save() {
    let (session, backend) = session(json!({}));
    assert!(session.lock("x").await);
    session.set_leaf_value("a", json!(1));
    session.request_manual_save();
    assert_eq!(session.save().await.unwrap(), SaveOutcome::NothingToSave);
    assert_eq!(backend.put_count(), 0);

    assert!(!session.unlock("y", None));
    assert!(session.unlock("x", None));
    assert_eq!(session.save().await.unwrap(), SaveOutcome::Saved);
}

#[tokio::test]
async fn unlock_with_new_data_replaces_every_snapshot() {
    let (session, backend) = session(json!({"a": 1}));
    assert!(session.lock("x").await);
    assert!(session.unlock("x", Some(json!({"a": 9}))));

    let store = session.store();
    assert_eq!(store.current(), &json!({"a": 9}));
    assert_eq!(store.debounced(), &json!({"a": 9}));
    assert_eq!(store.last_saved(), &json!({"a": 9}));
    drop(store);
    assert_eq!(session.save().await.unwrap(), SaveOutcome::NothingToSave);
    assert_eq!(backend.put_count(), 0);
}
