mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Notify;

use common::{
    cite_passage_with, last_user, test_app, test_app_with, test_config, three_paragraphs,
    KeywordEmbedder, ScriptedChat, TestApp,
};
use open_notebook::error::{ErrorKind, ProviderError};
use open_notebook::models::{AuthorKind, MessageRole, SourceDescriptor};
use open_notebook::providers::{Backend, ModelTarget, Role, RoleBinding, UsageOutcome};
use open_notebook::retrieval::QueryState;

async fn app_with_zebra_source(chat: ScriptedChat) -> (TestApp, String, String) {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.chunking.overlap_chars = 100;
    let t = test_app(config, tmp, KeywordEmbedder::new("embed"), chat).await;
    let notebook = t.app.store.create_notebook("Savanna", None).await.unwrap();
    let job = t
        .app
        .pipeline
        .submit(
            &notebook.id,
            SourceDescriptor::Text {
                text: three_paragraphs(),
                title: Some("Field notes".into()),
            },
        )
        .await
        .unwrap();
    let source_id = job.source_id.clone();
    job.wait().await.unwrap();
    (t, notebook.id, source_id)
}

#[tokio::test]
async fn test_answer_cites_the_matching_chunk() {
    let (t, notebook_id, source_id) =
        app_with_zebra_source(ScriptedChat::new("chat", cite_passage_with("zebra"))).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();

    let answer = t
        .app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "When do zebras graze?")
        .await
        .unwrap();

    let chunks = t.app.store.list_chunks(&source_id).await.unwrap();
    assert_eq!(answer.cited_chunk_ids, vec![chunks[1].id.clone()]);
    assert!(answer.answer_text.contains("zebra"));
    assert!(!answer.rewritten);
    assert_eq!(answer.model, "scripted");
    assert_eq!(
        answer.trace,
        vec![
            QueryState::Received,
            QueryState::Rewritten,
            QueryState::Retrieved,
            QueryState::Grounded,
            QueryState::Answered,
        ]
    );

    // The top-ranked passage is the zebra chunk.
    let prompt = t.chat.requests.lock().unwrap()[0].clone();
    let user = last_user(&prompt);
    let first_passage = user.split("[2]").next().unwrap();
    assert!(first_passage.contains("zebra"), "{}", user);
    assert!(user.contains("(Field notes)"));
}

#[tokio::test]
async fn test_history_is_append_only() {
    let (t, notebook_id, _) =
        app_with_zebra_source(ScriptedChat::new("chat", cite_passage_with("zebra"))).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "Grazing")
        .await
        .unwrap();

    t.app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "When do zebras graze?")
        .await
        .unwrap();
    let first = t.app.store.messages(&conversation.id).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].role, MessageRole::User);
    assert_eq!(first[1].role, MessageRole::Assistant);
    assert_eq!(first[1].cited_chunk_ids.len(), 1);

    t.app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "Summarize the zebra notes")
        .await
        .unwrap();
    let second = t.app.store.messages(&conversation.id).await.unwrap();
    assert_eq!(second.len(), 4);
    for (old, new) in first.iter().zip(&second) {
        assert_eq!(old.id, new.id);
        assert_eq!(old.seq, new.seq);
        assert_eq!(old.text, new.text);
        assert_eq!(old.cited_chunk_ids, new.cited_chunk_ids);
    }
    let seqs: Vec<i64> = second.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    // The earlier turn is sent back as history.
    let requests = t.chat.requests.lock().unwrap();
    let last = requests.last().unwrap();
    assert!(last
        .iter()
        .any(|m| m.role == MessageRole::User && m.content == "When do zebras graze?"));
}

#[tokio::test]
async fn test_follow_up_question_is_rewritten() {
    let chat = ScriptedChat::new("chat", |messages| {
        let system = &messages[0].content;
        if system.starts_with("Rewrite") {
            return Ok("\"When do zebras graze at dawn?\"".to_string());
        }
        cite_passage_with("zebra")(messages)
    });
    let (t, notebook_id, _) = app_with_zebra_source(chat).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();

    t.app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "Tell me about zebras")
        .await
        .unwrap();
    let answer = t
        .app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "When do they graze?")
        .await
        .unwrap();

    assert!(answer.rewritten);
    assert_eq!(answer.query, "When do zebras graze at dawn?");
    assert_eq!(answer.cited_chunk_ids.len(), 1);
    // The transcript keeps the question as asked.
    let messages = t.app.store.messages(&conversation.id).await.unwrap();
    assert_eq!(messages[2].text, "When do they graze?");
}

#[tokio::test]
async fn test_search_only_sees_chunks_of_the_query_model() {
    let (t, notebook_id, _) =
        app_with_zebra_source(ScriptedChat::new("chat", cite_passage_with("zebra"))).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();

    // Same backend, different model id: the stored vectors no longer match.
    t.app
        .set_role(
            Role::Embedding,
            RoleBinding::new(ModelTarget::new("embed", "kw-2")),
        )
        .await
        .unwrap();

    let answer = t
        .app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "When do zebras graze?")
        .await
        .unwrap();
    assert!(answer.cited_chunk_ids.is_empty());
    let prompt = t.chat.requests.lock().unwrap()[0].clone();
    assert!(last_user(&prompt).contains("no passages matched"));
}

#[tokio::test]
async fn test_chat_failover_is_logged() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.chunking.overlap_chars = 100;
    let down = Arc::new(ScriptedChat::new("down", |_| {
        Err(ProviderError::Server {
            provider: "down".into(),
            status: 503,
            message: "unavailable".into(),
        })
    }));
    let t = test_app_with(
        config,
        tmp,
        KeywordEmbedder::new("embed"),
        ScriptedChat::new("chat", cite_passage_with("zebra")),
        vec![down.clone() as Arc<dyn Backend>],
    )
    .await;
    t.app
        .set_role(
            Role::Chat,
            RoleBinding::new(ModelTarget::new("down", "big"))
                .with_fallback(ModelTarget::new("chat", "scripted")),
        )
        .await
        .unwrap();

    let notebook = t.app.store.create_notebook("Failover", None).await.unwrap();
    t.app
        .pipeline
        .submit(
            &notebook.id,
            SourceDescriptor::Text {
                text: three_paragraphs(),
                title: None,
            },
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let conversation = t
        .app
        .store
        .create_conversation(&notebook.id, "")
        .await
        .unwrap();

    let answer = t
        .app
        .orchestrator
        .ask(&notebook.id, &conversation.id, "When do zebras graze?")
        .await
        .unwrap();
    assert_eq!(answer.provider, "chat");
    assert_eq!(answer.model, "scripted");
    assert_eq!(answer.cited_chunk_ids.len(), 1);
    assert_eq!(down.calls(), 1);

    let usage = t.app.registry.usage().snapshot();
    let chat_calls: Vec<_> = usage.iter().filter(|r| r.role == Role::Chat).collect();
    assert_eq!(chat_calls.len(), 2);
    assert_eq!(chat_calls[0].provider, "down");
    assert!(matches!(chat_calls[0].outcome, UsageOutcome::Failure(_)));
    assert_eq!(chat_calls[1].provider, "chat");
    assert_eq!(chat_calls[1].outcome, UsageOutcome::Success);
    assert!(usage
        .iter()
        .any(|r| r.role == Role::Embedding && r.model == "kw-1"));
}

#[tokio::test]
async fn test_failed_query_writes_nothing() {
    let chat = ScriptedChat::new("chat", |_| {
        Err(ProviderError::InvalidCredential {
            provider: "chat".into(),
            message: "revoked".into(),
        })
    });
    let (t, notebook_id, _) = app_with_zebra_source(chat).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();

    let failure = t
        .app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "When do zebras graze?")
        .await
        .unwrap_err();
    assert_eq!(failure.state, QueryState::Grounded);
    assert_eq!(failure.kind, ErrorKind::PermanentProvider);
    assert!(!failure.is_transient());
    assert_eq!(failure.trace.last(), Some(&QueryState::Failed));
    assert!(t.app.store.messages(&conversation.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_conversation_from_other_notebook_is_rejected() {
    let (t, notebook_id, _) =
        app_with_zebra_source(ScriptedChat::new("chat", cite_passage_with("zebra"))).await;
    let other = t.app.store.create_notebook("Other", None).await.unwrap();
    let conversation = t
        .app
        .store
        .create_conversation(&other.id, "")
        .await
        .unwrap();

    let failure = t
        .app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "When do zebras graze?")
        .await
        .unwrap_err();
    assert_eq!(failure.state, QueryState::Received);
    assert_eq!(t.chat.calls(), 0);
}

#[tokio::test]
async fn test_answer_saved_as_note() {
    let (t, notebook_id, source_id) =
        app_with_zebra_source(ScriptedChat::new("chat", cite_passage_with("zebra"))).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();
    let answer = t
        .app
        .orchestrator
        .ask(&notebook_id, &conversation.id, "When do zebras graze?")
        .await
        .unwrap();

    let note = t
        .app
        .orchestrator
        .save_answer_as_note(&notebook_id, &answer, Some("Grazing"))
        .await
        .unwrap();
    assert_eq!(note.author, AuthorKind::Ai);
    assert_eq!(note.source_id.as_deref(), Some(source_id.as_str()));
    assert_eq!(note.text, answer.answer_text);
    assert_eq!(t.app.store.list_notes(&notebook_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_query_discards_in_flight_answer() {
    let gate = Arc::new(Notify::new());
    let chat = ScriptedChat::gated("chat", Arc::clone(&gate), cite_passage_with("zebra"));
    let (t, notebook_id, _) = app_with_zebra_source(chat).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();
    let cancelled = AtomicBool::new(false);

    let (result, _) = tokio::join!(
        t.app.orchestrator.ask_cancellable(
            &notebook_id,
            &conversation.id,
            "When do zebras graze?",
            &cancelled
        ),
        async {
            // Cancel while the answer is being generated, then let it finish.
            t.chat.entered.notified().await;
            cancelled.store(true, Ordering::SeqCst);
            gate.notify_one();
        }
    );

    let failure = result.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.state, QueryState::Grounded);
    assert!(failure.reason.contains("cancelled"));
    assert_eq!(failure.trace.last(), Some(&QueryState::Failed));
    assert_eq!(t.chat.calls(), 1);
    assert!(t.app.store.messages(&conversation.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_before_start_never_calls_chat() {
    let (t, notebook_id, _) =
        app_with_zebra_source(ScriptedChat::new("chat", cite_passage_with("zebra"))).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();

    let failure = t
        .app
        .orchestrator
        .ask_cancellable(
            &notebook_id,
            &conversation.id,
            "When do zebras graze?",
            &AtomicBool::new(true),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.state, QueryState::Received);
    assert_eq!(t.chat.calls(), 0);
}

#[tokio::test]
async fn test_one_question_at_a_time_per_conversation() {
    let gate = Arc::new(Notify::new());
    let chat = ScriptedChat::gated("chat", Arc::clone(&gate), cite_passage_with("zebra"));
    let (t, notebook_id, _) = app_with_zebra_source(chat).await;
    let conversation = t
        .app
        .store
        .create_conversation(&notebook_id, "")
        .await
        .unwrap();
    let orchestrator = &t.app.orchestrator;

    let (first, second, _) = tokio::join!(
        orchestrator.ask(&notebook_id, &conversation.id, "When do zebras graze?"),
        orchestrator.ask(&notebook_id, &conversation.id, "Where do zebras sleep?"),
        async {
            t.chat.entered.notified().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            // The second question is queued behind the first.
            assert_eq!(t.chat.calls(), 1);
            assert_eq!(orchestrator.busy_conversations(), 1);
            gate.notify_one();

            t.chat.entered.notified().await;
            let stored = t.app.store.messages(&conversation.id).await.unwrap();
            assert_eq!(stored.len(), 2, "first turn must be stored before the second starts");
            gate.notify_one();
        }
    );
    first.unwrap();
    second.unwrap();

    let stored = t.app.store.messages(&conversation.id).await.unwrap();
    let turns: Vec<(MessageRole, i64)> = stored.iter().map(|m| (m.role, m.seq)).collect();
    assert_eq!(
        turns,
        vec![
            (MessageRole::User, 1),
            (MessageRole::Assistant, 2),
            (MessageRole::User, 3),
            (MessageRole::Assistant, 4),
        ]
    );
    assert_eq!(stored[0].text, "When do zebras graze?");
    assert_eq!(stored[2].text, "Where do zebras sleep?");
    assert_eq!(orchestrator.busy_conversations(), 0);
}
