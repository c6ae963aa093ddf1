use std::sync::Arc;

use watchdog_core::{
    Conversation, ConversationStore, GatewayError, LoopError, LoopEvent, MockGateway, MockReply,
    Role, SafetyClassifier, SafetyLoop, StreamReporter, Verdict, WatchdogConfig,
    FALLBACK_RESPONSE,
};

const GEN: &str = "gen-model";
const WD: &str = "wd-model";

const FLAGGED: &str = "Missed opportunities to acknowledge the user's distress. \
                       A better response would offer a crisis line.";

fn config(max_attempts: u32) -> WatchdogConfig {
    WatchdogConfig {
        generator_model: GEN.to_string(),
        watchdog_model: WD.to_string(),
        max_attempts,
        ..WatchdogConfig::default()
    }
}

fn approving() -> Arc<MockGateway> {
    Arc::new(
        MockGateway::new()
            .with_fallback(GEN, "Hello, I'm here for you.")
            .with_fallback(WD, "ACCEPTABLE"),
    )
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<LoopEvent>) -> Vec<LoopEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

/// Collapse consecutive chunk events so the order of phases is easy to assert.
fn phases(events: &[LoopEvent]) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for ev in events {
        let status = ev.status();
        if status.ends_with("_chunk") && out.last() == Some(&status) {
            continue;
        }
        out.push(status);
    }
    out
}

#[tokio::test]
async fn accepted_first_attempt_settles_immediately() {
    let gw = approving();
    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let mut conv = Conversation::default();

    let outcome = safety.run(&mut conv, "hi", None).await.unwrap();

    assert!(outcome.accepted);
    assert_eq!(outcome.settled_text, "Hello, I'm here for you.");
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.attempts[0].verdict, Verdict::Safe);
    assert!(outcome.final_rationale.is_empty());

    assert_eq!(gw.calls_for(GEN).len(), 1);
    assert_eq!(gw.calls_for(WD).len(), 1);

    let turns = conv.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "hi");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].content, "Hello, I'm here for you.");
}

#[tokio::test]
async fn flagged_attempt_is_revised_with_feedback() {
    let gw = approving();
    gw.push(GEN, MockReply::text("Just sleep it off."));
    gw.push(GEN, MockReply::text("That sounds really hard. Would talking to someone help?"));
    gw.push(WD, MockReply::text(FLAGGED));

    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let mut conv = Conversation::default();
    let outcome = safety.run(&mut conv, "I feel hopeless", None).await.unwrap();

    assert!(outcome.accepted);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.attempts[0].verdict, Verdict::Unsafe);
    assert_eq!(outcome.attempts[0].rationale, FLAGGED);
    assert_eq!(
        outcome.settled_text,
        "That sounds really hard. Would talking to someone help?"
    );

    let gen_calls = gw.calls_for(GEN);
    assert_eq!(gen_calls.len(), 2);
    // generator is always prompted single-turn
    assert_eq!(gen_calls[0].len(), 1);
    assert_eq!(gen_calls[0][0].content, "I feel hopeless");
    assert_eq!(gen_calls[1].len(), 1);
    let revision = &gen_calls[1][0].content;
    assert!(revision.contains(FLAGGED));
    assert!(revision.contains("Original user message: I feel hopeless"));

    // one assistant turn, holding the accepted text
    assert_eq!(conv.assistant_turns(), 1);
    assert_eq!(conv.turns()[1].content, outcome.settled_text);
}

#[tokio::test]
async fn exhaustion_returns_fallback_after_bounded_attempts() {
    let gw = Arc::new(
        MockGateway::new()
            .with_fallback(GEN, "Try harder.")
            .with_fallback(WD, "You should have offered support."),
    );
    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let mut conv = Conversation::default();

    let outcome = safety.run(&mut conv, "nothing matters", None).await.unwrap();

    assert!(!outcome.accepted);
    assert_eq!(outcome.settled_text, FALLBACK_RESPONSE);
    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(
        outcome.attempts.iter().map(|a| a.index).collect::<Vec<_>>(),
        [1, 2, 3]
    );
    assert_eq!(outcome.final_rationale, "You should have offered support.");
    assert_eq!(gw.calls_for(GEN).len(), 3);
    assert_eq!(gw.calls_for(WD).len(), 3);

    // history keeps the last model output, not the fallback
    assert_eq!(conv.len(), 2);
    assert_eq!(conv.turns()[1].content, "Try harder.");
}

#[tokio::test]
async fn zero_attempt_bound_still_runs_once() {
    let gw = approving();
    let safety = SafetyLoop::new(gw.clone(), &config(0));
    assert_eq!(safety.max_attempts(), 1);

    let mut conv = Conversation::default();
    let outcome = safety.run(&mut conv, "hi", None).await.unwrap();
    assert_eq!(outcome.attempts.len(), 1);
}

#[tokio::test]
async fn gateway_failure_aborts_without_assistant_turn() {
    let gw = approving();
    gw.push(GEN, MockReply::Fail("upstream unavailable".into()));
    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let mut conv = Conversation::default();

    let err = safety.run(&mut conv, "hi", None).await.unwrap_err();

    assert!(matches!(err, LoopError::Gateway(GatewayError::Api { status: 503, .. })));
    assert_eq!(conv.len(), 1);
    assert_eq!(conv.turns()[0].role, Role::User);
    // a gateway error is not retried
    assert_eq!(gw.calls_for(GEN).len(), 1);
    assert!(gw.calls_for(WD).is_empty());
}

#[tokio::test]
async fn watchdog_failure_mid_loop_is_fatal() {
    let gw = approving();
    gw.push(WD, MockReply::text(FLAGGED));
    gw.push(WD, MockReply::Fail("rate limited".into()));
    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let mut conv = Conversation::default();

    let err = safety.run(&mut conv, "hi", None).await.unwrap_err();
    assert!(matches!(err, LoopError::Gateway(_)));
    assert_eq!(conv.assistant_turns(), 0);
}

#[tokio::test]
async fn watchdog_sees_prior_turns_generator_does_not() {
    let gw = approving();
    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let mut conv = Conversation::default();

    safety.run(&mut conv, "I lost my job", None).await.unwrap();
    safety.run(&mut conv, "and now I can't sleep", None).await.unwrap();

    assert_eq!(conv.len(), 4);

    let wd_calls = gw.calls_for(WD);
    assert!(!wd_calls[0][1].content.contains("Conversation so far"));
    let second = &wd_calls[1][1].content;
    assert!(second.contains("User: I lost my job"));
    assert!(second.contains("Assistant: Hello, I'm here for you."));
    assert!(second.contains("User's original message: and now I can't sleep"));

    let gen_calls = gw.calls_for(GEN);
    assert_eq!(gen_calls[1].len(), 1);
    assert_eq!(gen_calls[1][0].content, "and now I can't sleep");
}

#[tokio::test]
async fn streamed_events_follow_loop_order() {
    let gw = approving();
    gw.push(GEN, MockReply::fragments(["Hel", "lo, ", "world"]));
    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let (reporter, mut rx) = StreamReporter::channel(256);
    let mut conv = Conversation::default();

    let outcome = safety.run(&mut conv, "hi", Some(&reporter)).await.unwrap();
    let events = drain(&mut rx);

    assert_eq!(
        phases(&events),
        [
            "generator_thinking",
            "generator_response_chunk",
            "generator_response_done",
            "watchdog_assessing",
            "watchdog_response_chunk",
            "watchdog_response_done",
            "complete",
        ]
    );

    let accumulated: Vec<&str> = events
        .iter()
        .filter_map(|ev| match ev {
            LoopEvent::GeneratorResponseChunk { accumulated, .. } => Some(accumulated.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(accumulated, ["Hel", "Hello, ", "Hello, world"]);

    match events.last() {
        Some(LoopEvent::Complete(report)) => {
            assert_eq!(report.response, "Hello, world");
            assert_eq!(report.response, outcome.settled_text);
            assert!(!report.flagged);
            assert_eq!(report.attempts, 1);
        }
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_stream_ends_with_failed_and_no_trailing_revision() {
    let gw = Arc::new(
        MockGateway::new()
            .with_fallback(GEN, "Try harder.")
            .with_fallback(WD, FLAGGED),
    );
    let safety = SafetyLoop::new(gw, &config(2));
    let (reporter, mut rx) = StreamReporter::channel(256);
    let mut conv = Conversation::default();

    safety.run(&mut conv, "hi", Some(&reporter)).await.unwrap();
    let events = drain(&mut rx);

    assert_eq!(
        phases(&events),
        [
            "generator_thinking",
            "generator_response_chunk",
            "generator_response_done",
            "watchdog_assessing",
            "watchdog_response_chunk",
            "watchdog_response_done",
            "revision_needed",
            "generator_thinking",
            "generator_response_chunk",
            "generator_response_done",
            "watchdog_assessing",
            "watchdog_response_chunk",
            "watchdog_response_done",
            "failed",
        ]
    );

    match events.last() {
        Some(LoopEvent::Failed(report)) => {
            assert!(report.flagged);
            assert_eq!(report.response, FALLBACK_RESPONSE);
            assert_eq!(report.reason, FLAGGED);
            assert_eq!(report.all_generator_responses.len(), 2);
        }
        other => panic!("expected failed, got {other:?}"),
    }
}

#[tokio::test]
async fn dropped_receiver_cancels_loop() {
    let gw = approving();
    let safety = SafetyLoop::new(gw.clone(), &config(3));
    let (reporter, rx) = StreamReporter::channel(4);
    drop(rx);
    let mut conv = Conversation::default();

    let err = safety.run(&mut conv, "hi", Some(&reporter)).await.unwrap_err();
    assert!(matches!(err, LoopError::Cancelled));
    assert!(gw.calls().is_empty());
    assert_eq!(conv.assistant_turns(), 0);
}

#[tokio::test]
async fn busy_session_is_rejected() {
    let gw = approving();
    let safety = SafetyLoop::new(gw, &config(3));
    let store = ConversationStore::default();

    let _held = store.acquire("s1").unwrap();
    let err = safety.converse(&store, "s1", "hi", None).await.unwrap_err();
    assert!(matches!(err, LoopError::SessionBusy(ref id) if id == "s1"));

    let outcome = safety.converse(&store, "s2", "hi", None).await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(store.snapshot("s2").unwrap().map(|t| t.len()), Some(2));
}

struct AlwaysUnsafe;

impl SafetyClassifier for AlwaysUnsafe {
    fn classify(&self, _text: &str) -> Verdict {
        Verdict::Unsafe
    }
}

#[tokio::test]
async fn classifier_is_pluggable() {
    let gw = approving();
    let safety = SafetyLoop::new(gw, &config(2)).with_classifier(Arc::new(AlwaysUnsafe));
    let mut conv = Conversation::default();

    let outcome = safety.run(&mut conv, "hi", None).await.unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.final_rationale, "ACCEPTABLE");
}
