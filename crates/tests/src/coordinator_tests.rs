use std::sync::Arc;
use std::time::Duration;

use parley_config::{DedupPolicy, Settings};
use parley_conversation::{ConversationError, OutcomeStatus, Role, SessionKey};
use tokio_util::sync::CancellationToken;

use crate::fixtures::doubles::{ScriptedLlm, TimerSkill};
use crate::fixtures::harness::{Harness, PARTICIPANT};

const REPLY: &str = "It is sunny and warm in Paris today.";

fn slow_llm() -> ScriptedLlm {
    ScriptedLlm::new(REPLY).with_token_delay(Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn partial_trigger_starts_one_session_and_refreshes_context() {
    let h = Harness::new(slow_llm());

    let out = h.send(h.partial("u1", "What is", 1, 0)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalPartialQueued);

    let out = h
        .send(h.partial("u1", "What is the weather like today?", 2, 100))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalOnlineLlmStarted);
    assert_eq!(out.reason.as_deref(), Some("sentence_ending"));
    let session_id = out.session_id.unwrap();
    assert_eq!(h.coordinator.active_session_count(), 1);

    let refined = "What is the weather like today? In Paris";
    let out = h.send(h.partial("u1", refined, 3, 200)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::PartialProcessed);
    assert_eq!(out.session_id.as_deref(), Some(session_id.as_str()));
    assert_eq!(h.coordinator.active_session_count(), 1);

    h.settle().await;
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(h.llm.latest_context(0).as_deref(), Some(refined));

    let history = h.history(PARTICIPANT).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, refined);
    assert_eq!(history[1].text, REPLY);
    assert_eq!(h.tts.spoken().concat().replace(' ', ""), REPLY.replace(' ', ""));

    let out = h
        .send(h.partial("u1", "What is the weather like today? In Paris, France", 4, 900))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::PartialIgnored);
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn insignificant_and_out_of_order_partials_are_ignored() {
    let h = Harness::new(slow_llm());

    h.send(h.partial("u1", "Tell me", 2, 0)).await.unwrap();
    let out = h.send(h.partial("u1", "Tell me a", 3, 50)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::PartialIgnored);
    let out = h.send(h.partial("u1", "Tell me a story about", 1, 60)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::PartialIgnored);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn replayed_message_is_processed_once() {
    let h = Harness::new(ScriptedLlm::new("Why did the chicken cross the road?"));
    let mut event = h.final_transcript("u1", "Tell me a joke please.", 0);
    event.message_id = Some("msg-1".to_string());

    let first = h.send(event.clone()).await.unwrap();
    assert_eq!(first.status, OutcomeStatus::StreamingSuccess);
    assert_eq!(
        first.ai_response.as_deref(),
        Some("Why did the chicken cross the road?")
    );
    assert!(first.first_token_ms.is_some());

    let replay = h.send(event).await.unwrap();
    assert_eq!(replay.status, OutcomeStatus::DuplicateBlocked);
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_policy_supersedes_running_partial_session() {
    let h = Harness::new(slow_llm());
    let text = "Could you tell me about the weather?";

    let out = h.send(h.partial("u1", text, 1, 0)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalOnlineLlmStarted);
    let partial_session = out.session_id.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let out = h.send(h.final_transcript("u1", text, 300)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::StreamingSuccess);
    assert_ne!(out.session_id.as_deref(), Some(partial_session.as_str()));
    assert_eq!(out.ai_response.as_deref(), Some(REPLY));

    h.settle().await;
    assert_eq!(h.llm.calls(), 2);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 1);
    assert!(h.coordinator.session_id(&SessionKey::new(PARTICIPANT, "u1")).is_none());
}

#[tokio::test(start_paused = true)]
async fn block_final_policy_keeps_partial_session() {
    let mut settings = Settings::default();
    settings.coordinator.dedup_policy = DedupPolicy::BlockFinal;
    let h = Harness::with_settings(slow_llm(), settings);

    let out = h
        .send(h.partial("u1", "Could you tell me about the weather", 1, 0))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalOnlineLlmStarted);
    let partial_session = out.session_id.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let final_text = "Could you tell me about the weather in Paris?";
    let out = h.send(h.final_transcript("u1", final_text, 200)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::FinalIgnoredDueToPartial);
    assert_eq!(out.session_id.as_deref(), Some(partial_session.as_str()));

    h.settle().await;
    assert_eq!(h.llm.calls(), 1);
    let history = h.history(PARTICIPANT).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, final_text);
}

#[tokio::test(start_paused = true)]
async fn final_after_answered_partial_is_ignored() {
    let h = Harness::new(ScriptedLlm::new("Sure."));

    let out = h
        .send(h.partial("u1", "Can you set a reminder?", 1, 0))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalOnlineLlmStarted);
    h.settle().await;

    let out = h
        .send(h.final_transcript("u1", "Can you set a reminder?", 2000))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::FinalIgnoredDueToPartial);
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 1);
}

#[tokio::test(start_paused = true)]
async fn late_partial_does_not_rewrite_running_final() {
    let h = Harness::new(slow_llm());
    let final_text = "What time is it in Tokyo?";

    let coordinator = Arc::clone(&h.coordinator);
    let final_event = h.final_transcript("u1", final_text, 0);
    let running = tokio::spawn(async move { coordinator.handle_event(final_event).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.coordinator.active_session_count(), 1);

    let out = h
        .send(h.partial("u1", "What time is it in To", 5, 100))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::PartialIgnored);
    assert_eq!(out.reason.as_deref(), Some("final response in progress"));

    let out = running.await.unwrap().unwrap();
    assert_eq!(out.status, OutcomeStatus::StreamingSuccess);
    assert_eq!(h.llm.calls(), 1);

    let history = h.history(PARTICIPANT).await;
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, final_text);
}

#[tokio::test(start_paused = true)]
async fn filtered_final_reports_gate_reason() {
    let h = Harness::new(ScriptedLlm::new("Noon."));

    let out = h
        .send(h.final_transcript("u1", "What time is it?", 0))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::StreamingSuccess);

    let out = h
        .send(h.final_transcript("u2", "And in Tokyo?", 100))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::FinalTranscriptFiltered);
    assert!(out.reason.unwrap().contains("cooldown"));
}

#[tokio::test(start_paused = true)]
async fn at_most_one_session_under_concurrent_partials() {
    let h = Arc::new(Harness::new(slow_llm()));
    let texts = [
        "Could you explain how tides work?",
        "Could you explain how tides work? Please",
        "Could you explain how tides work? Please, briefly",
        "Could you explain how tides work? Please, briefly and simply",
    ];

    let mut handles = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        let h = h.clone();
        let event = h.partial("u1", text, i as u64 + 1, i as i64 * 10);
        handles.push(tokio::spawn(async move { h.send(event).await.unwrap() }));
    }
    let mut started = 0;
    for handle in handles {
        let out = handle.await.unwrap();
        if out.status == OutcomeStatus::NaturalOnlineLlmStarted {
            started += 1;
        }
        assert!(h.coordinator.active_session_count() <= 1);
    }
    assert_eq!(started, 1);

    h.settle().await;
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_and_open_breaker_are_rejected() {
    let h = Harness::new(slow_llm());

    h.guards.set_request_allowed(false);
    let err = h
        .send(h.final_transcript("u1", "What time is it?", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::RateLimitExceeded { .. }));
    assert_eq!(err.status_code(), 429);
    h.guards.set_request_allowed(true);

    h.guards.set_ai_allowed(false);
    let err = h
        .send(h.event("bob", "u2", "What time is it?", false, 1, 100))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    h.guards.set_ai_allowed(true);

    h.guards.open_breaker("model provider degraded");
    let err = h
        .send(h.event("carol", "u3", "What time is it?", false, 1, 200))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::CircuitOpen(ref reason) if reason == "model provider degraded"));
    assert_eq!(err.status_code(), 503);

    h.guards.close_breaker();
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn llm_failure_speaks_fallback_and_records_nothing() {
    let h = Harness::new(ScriptedLlm::new(REPLY).failing());
    let fallback = Settings::default().coordinator.fallback_phrase;

    let out = h
        .send(h.final_transcript("u1", "What is the weather like?", 0))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::FallbackSpoken);
    assert_eq!(out.ai_response.as_deref(), Some(fallback.as_str()));
    assert_eq!(out.reason.as_deref(), Some("upstream_llm"));

    let spoken = h.tts.spoken();
    assert_eq!(spoken.iter().filter(|s| **s == fallback).count(), 1);
    assert!(h.history(PARTICIPANT).await.is_empty());
    assert_eq!(h.guards.failures(), 1);
    assert_eq!(h.guards.successes(), 0);
}

#[tokio::test(start_paused = true)]
async fn skill_reply_bypasses_language_model() {
    let h = Harness::with_skills(slow_llm(), Arc::new(TimerSkill::default()));

    let out = h
        .send(h.final_transcript("u1", "Timer for five minutes", 0))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::SkillActivated);
    assert_eq!(out.ai_response.as_deref(), Some("Timer set for five minutes."));
    tokio::time::sleep(Duration::from_millis(500)).await;

    let out = h
        .send(h.final_transcript("u2", "Timer for ten minutes instead", 1000))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::SkillProcessed);

    assert_eq!(h.llm.calls(), 0);
    assert_eq!(h.tts.spoken().len(), 2);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_sessions_then_rejects_events() {
    let h = Harness::new(slow_llm());

    h.send(h.partial("u1", "What is the weather like today?", 1, 0))
        .await
        .unwrap();
    assert_eq!(h.coordinator.active_session_count(), 1);

    h.coordinator.shutdown().await;
    assert_eq!(h.coordinator.active_session_count(), 0);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 1);

    let err = h
        .send(h.partial("u2", "Hello there", 1, 5000))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_sessions_past_timeout() {
    let mut settings = Settings::default();
    settings.coordinator.shutdown_timeout_secs = 1;
    let llm = ScriptedLlm::new(REPLY).with_token_delay(Duration::from_secs(10));
    let h = Harness::with_settings(llm, settings);

    h.send(h.partial("u1", "What is the weather like today?", 1, 0))
        .await
        .unwrap();
    h.coordinator.shutdown().await;

    assert_eq!(h.coordinator.active_session_count(), 0);
    assert!(h.history(PARTICIPANT).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sweeper_purges_idle_utterances() {
    let h = Harness::new(slow_llm());
    let out = h.send(h.partial("u1", "So anyway", 1, 0)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalPartialQueued);
    assert_eq!(h.coordinator.utterances().len(), 1);

    let cancel = CancellationToken::new();
    let sweeper = h.coordinator.spawn_sweeper(cancel.clone());
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(h.coordinator.utterances().is_empty());
    assert!(!h.coordinator.utterances().is_processing_started(&SessionKey::new(PARTICIPANT, "u1")));

    cancel.cancel();
    sweeper.await.unwrap();
}
