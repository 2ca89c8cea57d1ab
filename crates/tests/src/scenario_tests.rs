use std::time::Duration;

use parley_conversation::{OutcomeStatus, Role};

use crate::fixtures::doubles::ScriptedLlm;
use crate::fixtures::harness::{Harness, PARTICIPANT};

#[tokio::test(start_paused = true)]
async fn weather_question_answered_once_when_final_supersedes_partial() {
    let h = Harness::new(
        ScriptedLlm::new("Let me check the forecast for you. It looks sunny all day.")
            .with_token_delay(Duration::from_millis(100)),
    );

    let out = h.send(h.partial("u1", "What is", 1, 0)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalPartialQueued);

    tokio::time::advance(Duration::from_millis(520)).await;
    let out = h
        .send(h.partial("u1", "What is the weather today", 2, 520))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalOnlineLlmStarted);
    let partial_session = out.session_id.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.llm.calls(), 1);

    let out = h
        .send(h.final_transcript("u1", "What is the weather today", 600))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::StreamingSuccess);
    assert_ne!(out.session_id.as_deref(), Some(partial_session.as_str()));

    h.settle().await;
    let history = h.history(PARTICIPANT).await;
    let roles: Vec<Role> = history.iter().map(|turn| turn.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant]);
    assert_eq!(history[0].text, "What is the weather today");
    assert_eq!(h.llm.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn statement_triggers_on_natural_pause() {
    let h = Harness::new(ScriptedLlm::new("Oh no, I am sorry to hear that."));

    let out = h.send(h.partial("u1", "My flight got", 1, 0)).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalPartialQueued);

    tokio::time::advance(Duration::from_millis(520)).await;
    let out = h
        .send(h.partial("u1", "My flight got cancelled again", 2, 520))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::NaturalOnlineLlmStarted);
    assert_eq!(out.reason.as_deref(), Some("natural_pause"));

    h.settle().await;
    let out = h
        .send(h.final_transcript("u1", "My flight got cancelled again.", 2000))
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::FinalIgnoredDueToPartial);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 1);
    assert_eq!(
        h.tts.spoken().concat().replace(' ', ""),
        "Ohno,Iamsorrytohearthat."
    );
}

#[tokio::test(start_paused = true)]
async fn separate_utterances_each_get_one_response() {
    let h = Harness::new(ScriptedLlm::new("Got it."));

    for (i, utterance) in ["u1", "u2", "u3"].iter().enumerate() {
        let at = i as i64 * 1000;
        let text = format!("Please remind me about task {i}.");
        let out = h
            .send(h.partial(utterance, &text, 1, at))
            .await
            .unwrap();
        assert_eq!(out.status, OutcomeStatus::NaturalOnlineLlmStarted);
        h.settle().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let out = h
            .send(h.final_transcript(utterance, &text, at + 600))
            .await
            .unwrap();
        assert_eq!(out.status, OutcomeStatus::FinalIgnoredDueToPartial);
    }

    assert_eq!(h.llm.calls(), 3);
    assert_eq!(h.assistant_turns(PARTICIPANT).await, 3);
}
