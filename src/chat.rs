//! Retrieval-augmented answering with streamed output and citations.
//!
//! An [`Answerer`] runs one request through
//! `retrieving → prompting → streaming → done | error` and reports each
//! step as a [`ChatEvent`] on a bounded channel. The `sources` event is
//! always sent before the first `chunk`; exactly one terminal event
//! (`done` or `error`) ends the stream.
//!
//! ```text
//! {"type":"sources","data":[{"document_id":"…","title":"Budget",…}]}
//! {"type":"chunk","content":"The budget is due "}
//! {"type":"chunk","content":"on Friday [1]."}
//! {"type":"done","content":"The budget is due on Friday [1]."}
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use knowledge_engine_core::embedding::EmbeddingProvider;
use knowledge_engine_core::llm::{ChatMessage, LlmProvider};
use knowledge_engine_core::models::SearchResult;
use knowledge_engine_core::store::Store;
use knowledge_engine_core::{EngineError, TransientKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::retrieve::hybrid_search;

/// Characters of chunk text kept in a citation preview.
pub const PREVIEW_CHARS: usize = 200;

const EVENT_BUFFER: usize = 64;

const SYSTEM_PROMPT: &str = "You are a personal knowledge assistant. Answer the question \
using only the numbered sources below. Cite the sources you use inline as [n]. If the \
sources do not contain the answer, say that you could not find it in the indexed documents.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub document_id: String,
    pub chunk_id: String,
    pub title: Option<String>,
    pub source_path: String,
    pub content_preview: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Sources { data: Vec<SourceCitation> },
    Chunk { content: String },
    Done { content: String },
    Error { content: String, partial: String },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { .. } | ChatEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerPhase {
    Retrieving,
    Prompting,
    Streaming,
    Done,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    /// Earlier turns, oldest first. Only the most recent ones are sent.
    pub history: Vec<ChatMessage>,
    /// Overrides the configured number of context chunks.
    pub top_k_context: Option<usize>,
}

/// Final state of one answer, returned to whoever drives [`Answerer::run`].
#[derive(Debug, Clone)]
pub struct AnswerOutcome {
    pub phase: AnswerPhase,
    pub answer: String,
    pub sources: Vec<SourceCitation>,
    pub error: Option<String>,
    /// The receiver went away before the answer finished.
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct AnswerSettings {
    pub semantic_weight: f64,
    pub top_k_context: usize,
    pub history_turns: usize,
    /// Bound on opening the stream, retries included.
    pub open_timeout: Duration,
    /// Bound on the wait for each fragment once the stream is open.
    pub fragment_timeout: Duration,
}

/// Answers one request with the providers that were active when it was
/// built. Cheap to clone.
#[derive(Clone)]
pub struct Answerer {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
    settings: AnswerSettings,
}

impl Answerer {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
        settings: AnswerSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            settings,
        }
    }

    /// Spawn the answer on the runtime and return the event receiver.
    ///
    /// Dropping the receiver stops generation at the next fragment.
    pub fn answer(self, request: ChatRequest) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            self.run(request, &tx).await;
        });
        rx
    }

    /// Drive one answer to completion, sending events on `tx`.
    pub async fn run(&self, request: ChatRequest, tx: &mpsc::Sender<ChatEvent>) -> AnswerOutcome {
        let mut run = Run::new(tx);

        let top_k = request
            .top_k_context
            .unwrap_or(self.settings.top_k_context);
        let results = match hybrid_search(
            self.store.as_ref(),
            self.embedder.as_ref(),
            &request.message,
            self.settings.semantic_weight,
            top_k,
        )
        .await
        {
            Ok(outcome) => outcome.results,
            Err(e) => return run.fail(e).await,
        };

        let sources = group_sources(&results);
        run.sources = sources.iter().map(|s| s.citation.clone()).collect();
        let data = run.sources.clone();
        if !run.emit(ChatEvent::Sources { data }).await {
            return run.finish_cancelled();
        }

        run.transition(AnswerPhase::Prompting);
        let messages = build_messages(
            &sources,
            &request.history,
            self.settings.history_turns,
            &request.message,
        );

        let open_timeout = self.settings.open_timeout;
        let mut stream =
            match tokio::time::timeout(open_timeout, self.llm.chat_stream(&messages)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return run.fail(e).await,
                Err(_) => return run.fail(fragment_timeout(self.llm.id(), open_timeout)).await,
            };

        let timeout = self.settings.fragment_timeout;
        run.transition(AnswerPhase::Streaming);
        loop {
            let next = match tokio::time::timeout(timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => return run.fail(fragment_timeout(self.llm.id(), timeout)).await,
            };
            match next {
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    run.answer.push_str(&fragment);
                    if !run.emit(ChatEvent::Chunk { content: fragment }).await {
                        return run.finish_cancelled();
                    }
                }
                Some(Err(e)) => return run.fail(e).await,
                None => break,
            }
        }

        run.transition(AnswerPhase::Done);
        let content = run.answer.clone();
        if !run.emit(ChatEvent::Done { content }).await {
            return run.finish_cancelled();
        }
        run.finish()
    }
}

fn fragment_timeout(provider: &str, timeout: Duration) -> EngineError {
    EngineError::transient(
        provider,
        TransientKind::Timeout,
        format!("no output for {}s", timeout.as_secs()),
    )
}

/// Book-keeping for one answer in flight.
struct Run<'a> {
    tx: &'a mpsc::Sender<ChatEvent>,
    phase: AnswerPhase,
    answer: String,
    sources: Vec<SourceCitation>,
}

impl<'a> Run<'a> {
    fn new(tx: &'a mpsc::Sender<ChatEvent>) -> Self {
        Self {
            tx,
            phase: AnswerPhase::Retrieving,
            answer: String::new(),
            sources: Vec::new(),
        }
    }

    fn transition(&mut self, next: AnswerPhase) {
        debug!(from = ?self.phase, to = ?next, "answer phase");
        self.phase = next;
    }

    /// False once the receiver is gone.
    async fn emit(&self, event: ChatEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    async fn fail(mut self, err: EngineError) -> AnswerOutcome {
        warn!(phase = ?self.phase, error = %err, "answer failed");
        self.transition(AnswerPhase::Error);
        let content = err.to_string();
        let delivered = self
            .emit(ChatEvent::Error {
                content: content.clone(),
                partial: self.answer.clone(),
            })
            .await;
        AnswerOutcome {
            phase: self.phase,
            answer: self.answer,
            sources: self.sources,
            error: Some(content),
            cancelled: !delivered,
        }
    }

    fn finish_cancelled(self) -> AnswerOutcome {
        debug!(phase = ?self.phase, "receiver dropped, answer abandoned");
        AnswerOutcome {
            phase: self.phase,
            answer: self.answer,
            sources: self.sources,
            error: None,
            cancelled: true,
        }
    }

    fn finish(self) -> AnswerOutcome {
        AnswerOutcome {
            phase: self.phase,
            answer: self.answer,
            sources: self.sources,
            error: None,
            cancelled: false,
        }
    }
}

/// One numbered source in the prompt: every retrieved chunk of a
/// document, cited once with the best chunk's score.
struct Source<'a> {
    citation: SourceCitation,
    chunks: Vec<&'a SearchResult>,
}

/// Results scoring zero are dropped: no keyword match and the weakest
/// vector of the candidate set.
fn group_sources(results: &[SearchResult]) -> Vec<Source<'_>> {
    let mut sources: Vec<Source<'_>> = Vec::new();
    for r in results.iter().filter(|r| r.combined_score > 0.0) {
        match sources
            .iter_mut()
            .find(|s| s.citation.document_id == r.document_id)
        {
            Some(source) => {
                if r.combined_score > source.citation.relevance_score {
                    source.citation.relevance_score = r.combined_score;
                    source.citation.chunk_id = r.chunk_id.clone();
                    source.citation.content_preview = preview(&r.text);
                }
                source.chunks.push(r);
            }
            None => sources.push(Source {
                citation: SourceCitation {
                    document_id: r.document_id.clone(),
                    chunk_id: r.chunk_id.clone(),
                    title: r.title.clone(),
                    source_path: r.source_path.clone(),
                    content_preview: preview(&r.text),
                    relevance_score: r.combined_score,
                },
                chunks: vec![r],
            }),
        }
    }
    for source in &mut sources {
        source.chunks.sort_by_key(|c| c.sequence_index);
    }
    sources
}

/// First [`PREVIEW_CHARS`] characters, with `...` when cut.
pub fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((i, _)) => format!("{}...", &text[..i]),
        None => text.to_string(),
    }
}

fn build_messages(
    sources: &[Source<'_>],
    history: &[ChatMessage],
    history_turns: usize,
    question: &str,
) -> Vec<ChatMessage> {
    let mut system = String::from(SYSTEM_PROMPT);
    system.push_str("\n\nSources:\n");
    if sources.is_empty() {
        system.push_str("(no matching documents were found)\n");
    }
    for (n, source) in sources.iter().enumerate() {
        let c = &source.citation;
        let label = c.title.as_deref().unwrap_or(&c.source_path);
        system.push_str(&format!("\n[{}] {} ({})\n", n + 1, label, c.source_path));
        for chunk in &source.chunks {
            system.push_str(chunk.text.trim());
            system.push('\n');
        }
    }

    let mut messages = Vec::with_capacity(history_turns + 2);
    messages.push(ChatMessage::system(system));
    let skip = history.len().saturating_sub(history_turns);
    messages.extend(history[skip..].iter().cloned());
    messages.push(ChatMessage::user(question));
    messages
}
