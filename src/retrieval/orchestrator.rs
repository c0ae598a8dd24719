use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::context::GroundedContext;
use super::state::{QueryRun, QueryState};
use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{ErrorKind, NotebookError, Result, StoreError};
use crate::models::{AuthorKind, Message, MessageRole, NewMessage, Note};
use crate::providers::{ChatMessage, ProviderRegistry, Role};
use crate::store::{NewNote, SqliteStore};

const ANSWER_PROMPT: &str = "You answer questions about the user's notebook using only the \
numbered passages provided. Cite every passage you rely on with its number in square brackets, \
for example [2]. If the passages do not contain the answer, say that the notebook does not cover it.";

const REWRITE_PROMPT: &str = "Rewrite the user's latest question as a standalone search query. \
Resolve pronouns and references using the earlier conversation. Reply with the query only.";

/// Words that usually point back at an earlier turn.
const REFERENTIAL: &[&str] = &[
    "it", "its", "they", "them", "their", "theirs", "this", "that", "these", "those", "he",
    "him", "his", "she", "her", "hers", "there", "former", "latter", "above", "previous",
    "earlier", "same", "else", "again",
];

/// A grounded answer.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub conversation_id: String,
    pub answer_text: String,
    /// Chunks the answer actually cites, in order of first citation.
    pub cited_chunk_ids: Vec<String>,
    /// The search query used, after any rewrite.
    pub query: String,
    pub rewritten: bool,
    /// The provider hit its output limit.
    pub truncated: bool,
    pub provider: String,
    pub model: String,
    pub trace: Vec<QueryState>,
}

/// A run that ended in `Failed`.
#[derive(Debug, Error)]
#[error("query failed while {state}: {reason}")]
pub struct QueryFailure {
    /// The last state reached before failing.
    pub state: QueryState,
    pub kind: ErrorKind,
    pub reason: String,
    pub transient: bool,
    pub trace: Vec<QueryState>,
}

impl QueryFailure {
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Drives questions through `Received → Rewritten → Retrieved → Grounded
/// → Answered`.
///
/// Nothing is written until the run reaches `Answered`, at which point the
/// question and the answer are appended to the conversation together.
/// Questions on the same conversation are serialized; different
/// conversations run concurrently.
pub struct Orchestrator {
    store: Arc<SqliteStore>,
    registry: Arc<ProviderRegistry>,
    embedder: Arc<Embedder>,
    config: RetrievalConfig,
    conversations: TurnLocks,
}

type TurnLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A claim on one conversation's turn lock. The map entry is removed when
/// the last claim goes away.
struct Turn<'a> {
    locks: &'a TurnLocks,
    conversation_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.conversation_id);
        }
    }
}

struct Grounding {
    query: String,
    rewritten: bool,
    history: Vec<Message>,
    context: GroundedContext,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        registry: Arc<ProviderRegistry>,
        embedder: Arc<Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            registry,
            embedder,
            config,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn conversation_turn(&self, conversation_id: &str) -> Turn<'_> {
        let mut locks = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = Arc::clone(locks.entry(conversation_id.to_string()).or_default());
        Turn {
            locks: &self.conversations,
            conversation_id: conversation_id.to_string(),
            lock,
        }
    }

    /// Conversations with a question running or queued.
    pub fn busy_conversations(&self) -> usize {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub async fn ask(
        &self,
        notebook_id: &str,
        conversation_id: &str,
        question: &str,
    ) -> std::result::Result<Answer, QueryFailure> {
        self.ask_cancellable(notebook_id, conversation_id, question, &AtomicBool::new(false))
            .await
    }

    /// Like [`Orchestrator::ask`], stopping at the next step boundary once
    /// `cancelled` is set. A provider call already in flight completes and
    /// its result is discarded; nothing is written to the conversation.
    pub async fn ask_cancellable(
        &self,
        notebook_id: &str,
        conversation_id: &str,
        question: &str,
        cancelled: &AtomicBool,
    ) -> std::result::Result<Answer, QueryFailure> {
        let turn = self.conversation_turn(conversation_id);
        let _held = turn.lock.lock().await;

        let mut run = QueryRun::new();
        match self
            .run(&mut run, notebook_id, conversation_id, question, cancelled)
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e) => {
                let state = run.fail();
                warn!(
                    conversation_id,
                    state = %state,
                    error = %e,
                    transient = e.is_transient(),
                    "query failed"
                );
                Err(QueryFailure {
                    state,
                    kind: e.kind(),
                    reason: e.to_string(),
                    transient: e.is_transient(),
                    trace: run.trace().to_vec(),
                })
            }
        }
    }

    async fn run(
        &self,
        run: &mut QueryRun,
        notebook_id: &str,
        conversation_id: &str,
        question: &str,
        cancelled: &AtomicBool,
    ) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(NotebookError::InvalidInput("question is empty".to_string()));
        }
        let conversation = self.store.get_conversation(conversation_id).await?;
        if conversation.notebook_id != notebook_id {
            return Err(StoreError::ConstraintViolation(format!(
                "conversation {} belongs to another notebook",
                conversation_id
            ))
            .into());
        }

        let grounding = self
            .ground(run, notebook_id, conversation_id, question, cancelled)
            .await?;

        checkpoint(cancelled)?;
        let messages = answer_messages(&grounding, question);
        let invocation = self.registry.chat(Role::Chat, messages).await?;
        let answer_text = invocation.output.text.trim().to_string();
        if answer_text.is_empty() {
            return Err(NotebookError::Provider(
                crate::error::ProviderError::malformed(&invocation.provider, "empty answer"),
            ));
        }
        if invocation.output.truncated {
            warn!(conversation_id, model = %invocation.model, "answer hit the output limit");
        }
        let cited_chunk_ids = grounding.context.cited_chunk_ids(&answer_text);

        checkpoint(cancelled)?;
        self.store
            .append_messages(
                conversation_id,
                &[
                    NewMessage::user(question),
                    NewMessage::assistant(answer_text.clone(), cited_chunk_ids.clone()),
                ],
            )
            .await?;
        run.advance(QueryState::Answered);
        info!(
            conversation_id,
            passages = grounding.context.passages.len(),
            cited = cited_chunk_ids.len(),
            provider = %invocation.provider,
            model = %invocation.model,
            "question answered"
        );

        Ok(Answer {
            conversation_id: conversation_id.to_string(),
            answer_text,
            cited_chunk_ids,
            query: grounding.query,
            rewritten: grounding.rewritten,
            truncated: invocation.output.truncated,
            provider: invocation.provider,
            model: invocation.model,
            trace: run.trace().to_vec(),
        })
    }

    /// Steps up to `Grounded`.
    async fn ground(
        &self,
        run: &mut QueryRun,
        notebook_id: &str,
        conversation_id: &str,
        question: &str,
        cancelled: &AtomicBool,
    ) -> Result<Grounding> {
        let history = if self.config.history_turns > 0 {
            self.store
                .recent_messages(conversation_id, self.config.history_turns)
                .await?
        } else {
            Vec::new()
        };

        let (query, rewritten) =
            if self.config.rewrite && !history.is_empty() && needs_rewrite(question) {
                (self.rewrite(&history, question).await?, true)
            } else {
                (question.to_string(), false)
            };
        checkpoint(cancelled)?;
        run.advance(QueryState::Rewritten);
        debug!(conversation_id, rewritten, query = %query, "search query fixed");

        let (vector, model) = self.embedder.embed_query(&query).await?;
        let hits = self
            .store
            .similarity_search(notebook_id, &vector, self.config.top_k, &model)
            .await?;
        checkpoint(cancelled)?;
        run.advance(QueryState::Retrieved);
        debug!(conversation_id, hits = hits.len(), model = %model, "retrieved");

        let context = GroundedContext::assemble(&hits, self.config.max_context_chars);
        if context.dropped > 0 {
            debug!(
                conversation_id,
                dropped = context.dropped,
                "passages dropped to fit the context limit"
            );
        }
        checkpoint(cancelled)?;
        run.advance(QueryState::Grounded);

        Ok(Grounding {
            query,
            rewritten,
            history,
            context,
        })
    }

    async fn rewrite(&self, history: &[Message], question: &str) -> Result<String> {
        let mut messages = vec![ChatMessage::system(REWRITE_PROMPT)];
        messages.extend(history.iter().map(to_chat));
        messages.push(ChatMessage::user(question));

        let invocation = self.registry.chat(Role::QueryRewrite, messages).await?;
        let rewritten = invocation.output.text.trim().trim_matches('"').trim();
        if rewritten.is_empty() {
            return Ok(question.to_string());
        }
        Ok(rewritten.to_string())
    }

    /// Keep an answer as an AI-authored note. The note references the
    /// source of the first cited chunk, if any.
    pub async fn save_answer_as_note(
        &self,
        notebook_id: &str,
        answer: &Answer,
        title: Option<&str>,
    ) -> Result<Note> {
        let source_id = match answer.cited_chunk_ids.first() {
            Some(chunk_id) => Some(self.store.get_chunk(chunk_id).await?.source_id),
            None => None,
        };
        let note = self
            .store
            .create_note(NewNote {
                notebook_id: notebook_id.to_string(),
                title: title.map(str::to_string),
                text: answer.answer_text.clone(),
                author: AuthorKind::Ai,
                source_id,
            })
            .await?;
        Ok(note)
    }
}

fn checkpoint(cancelled: &AtomicBool) -> Result<()> {
    if cancelled.load(Ordering::SeqCst) {
        Err(NotebookError::Cancelled)
    } else {
        Ok(())
    }
}

fn to_chat(message: &Message) -> ChatMessage {
    match message.role {
        MessageRole::User => ChatMessage::user(message.text.clone()),
        MessageRole::Assistant => ChatMessage::assistant(message.text.clone()),
        MessageRole::System => ChatMessage::system(message.text.clone()),
    }
}

fn answer_messages(grounding: &Grounding, question: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(ANSWER_PROMPT)];
    messages.extend(grounding.history.iter().map(to_chat));
    let passages = if grounding.context.is_empty() {
        "(no passages matched this question)\n\n".to_string()
    } else {
        grounding.context.render()
    };
    messages.push(ChatMessage::user(format!(
        "Passages:\n\n{}Question: {}",
        passages, question
    )));
    messages
}

/// Whether `question` leans on earlier turns and should be rewritten
/// before searching.
pub fn needs_rewrite(question: &str) -> bool {
    let lower = question.to_lowercase();
    if lower.starts_with("what about") || lower.starts_with("and ") || lower.starts_with("how about") {
        return true;
    }
    lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|word| REFERENTIAL.contains(&word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referential_questions_are_rewritten() {
        assert!(needs_rewrite("What year was it founded?"));
        assert!(needs_rewrite("And the second one?"));
        assert!(needs_rewrite("What about Mars?"));
        assert!(!needs_rewrite("When was the Hubble telescope launched?"));
        assert!(!needs_rewrite("Summarize the notebook's findings on soil carbon"));
    }
}
