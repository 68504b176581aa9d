//! Conversation turns and the interactive tutor loop.
//!
//! A turn streams the answer to a sink as it arrives. It is recorded only
//! when the stream completes: the pair is appended to the history log
//! first, then to the in-memory session. A turn that fails or is cancelled
//! leaves both untouched.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use ragtutor_core::chain::{ChainError, RagChain};
use ragtutor_core::models::Turn;
use ragtutor_core::prompt::PromptBuilder;
use ragtutor_core::retrieve::{RetrievedChunk, Retriever};
use ragtutor_core::session::ChatSession;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::config::{Config, Secrets};
use crate::db;
use crate::embedding::create_embedder;
use crate::history_log::HistoryLog;
use crate::llm::create_language_model;
use crate::migrate::ensure_schema;
use crate::sqlite_store::SqliteStore;
use crate::tokenizer::build_counter;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("failed to record turn: {0:#}")]
    History(anyhow::Error),
}

/// A finished turn and the chunks its answer drew on.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn: Turn,
    pub sources: Vec<RetrievedChunk>,
}

/// Answer one question, feeding fragments to `on_fragment` as they arrive.
pub async fn run_turn<F>(
    chain: &RagChain,
    session: &mut ChatSession,
    log: &HistoryLog,
    question: &str,
    long_term: Option<&str>,
    mut on_fragment: F,
) -> Result<TurnOutcome, TurnError>
where
    F: FnMut(&str),
{
    let mut stream = chain.answer(question, session, long_term).await?;
    let sources = stream.sources().to_vec();

    let mut answer = String::new();
    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        on_fragment(&fragment);
        answer.push_str(&fragment);
    }

    let at = Utc::now();
    let turn = Turn {
        timestamp: at,
        user: question.to_string(),
        assistant: answer,
    };
    log.append(&turn).map_err(TurnError::History)?;
    session.push_turn(turn.user.clone(), turn.assistant.clone(), at);
    debug!(messages = session.len(), "turn recorded");

    Ok(TurnOutcome { turn, sources })
}

/// Wire the store, embedder, model and prompt builder into a chain.
pub fn build_chain(config: &Config, secrets: &Secrets, pool: SqlitePool) -> Result<RagChain> {
    let store = Arc::new(SqliteStore::new(pool, config.db.collection.clone()));
    let embedder = create_embedder(&config.embedding, secrets)?;
    let retriever = Retriever::new(store, embedder, config.retrieval.params())?;
    let model = create_language_model(&config.chat, secrets)?;

    let mut prompts = PromptBuilder::new(config.chat.instructions()?);
    if let Some(max) = config.chat.max_context_tokens {
        prompts = prompts.with_context_budget(max, build_counter(&config.chunking)?);
    }
    Ok(RagChain::new(retriever, model, prompts))
}

fn print_fragment(fragment: &str) {
    print!("{}", fragment);
    let _ = std::io::stdout().flush();
}

fn print_sources(sources: &[RetrievedChunk]) {
    if sources.is_empty() {
        return;
    }
    println!("Sources:");
    for s in sources {
        println!(
            "  - {} (chunk {}/{}, {:.2})",
            s.source_id,
            s.chunk_index + 1,
            s.total_chunks,
            s.similarity
        );
    }
}

struct Tutor {
    chain: RagChain,
    log: HistoryLog,
    long_term: Option<String>,
    pool: SqlitePool,
}

async fn open_tutor(config: &Config) -> Result<Tutor> {
    config.embedding.require_enabled()?;
    let secrets = Secrets::for_chat(config)?;
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    let chain = build_chain(config, &secrets, pool.clone())?;
    let log = HistoryLog::new(&config.chat.history_path);
    let long_term = log.long_term_context(config.chat.history_sessions)?;
    Ok(Tutor {
        chain,
        log,
        long_term,
        pool,
    })
}

/// `tutor ask`: one question, answer streamed to stdout.
pub async fn run_ask(config: &Config, question: &str, show_sources: bool) -> Result<()> {
    let tutor = open_tutor(config).await?;
    let mut session = ChatSession::new(config.chat.greeting.clone());

    let outcome = run_turn(
        &tutor.chain,
        &mut session,
        &tutor.log,
        question,
        tutor.long_term.as_deref(),
        print_fragment,
    )
    .await?;
    println!();
    if show_sources {
        print_sources(&outcome.sources);
    }

    tutor.pool.close().await;
    Ok(())
}

/// `tutor chat`: read questions from stdin until EOF or `exit`.
///
/// Ctrl-C while an answer streams cancels that turn only.
pub async fn run_chat(config: &Config, show_sources: bool) -> Result<()> {
    let tutor = open_tutor(config).await?;
    let mut session = ChatSession::new(config.chat.greeting.clone());

    println!("{} (model: {})", config.chat.greeting, tutor.chain.model_name());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        let result = tokio::select! {
            r = run_turn(
                &tutor.chain,
                &mut session,
                &tutor.log,
                question,
                tutor.long_term.as_deref(),
                print_fragment,
            ) => Some(r),
            _ = tokio::signal::ctrl_c() => None,
        };
        println!();

        match result {
            Some(Ok(outcome)) => {
                if show_sources {
                    print_sources(&outcome.sources);
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "turn failed");
                eprintln!("Error: {}", e);
            }
            None => eprintln!("(cancelled)"),
        }
    }

    tutor.pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use ragtutor_core::embedding::Embedder;
    use ragtutor_core::llm::{LanguageModel, TextStream};
    use ragtutor_core::models::IndexRecord;
    use ragtutor_core::prompt::Prompt;
    use ragtutor_core::retrieve::MmrParams;
    use ragtutor_core::store::memory::InMemoryStore;
    use ragtutor_core::store::IndexStore;
    use tempfile::TempDir;

    struct ConstEmbedder;

    #[async_trait]
    impl Embedder for ConstEmbedder {
        fn model_name(&self) -> &str {
            "const"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct ScriptedModel {
        fragments: Vec<&'static str>,
        fail: bool,
        prompts: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, prompt: &Prompt) -> anyhow::Result<TextStream> {
            self.prompts.lock().unwrap().push(prompt.clone());
            let mut items: Vec<anyhow::Result<String>> =
                self.fragments.iter().map(|f| Ok(f.to_string())).collect();
            if self.fail {
                items.push(Err(anyhow!("stream dropped")));
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// Emits one fragment, then never finishes.
    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn stream(&self, _prompt: &Prompt) -> anyhow::Result<TextStream> {
            let head = futures::stream::iter(vec![Ok::<_, anyhow::Error>("partial ".to_string())]);
            Ok(Box::pin(head.chain(futures::stream::pending())))
        }
    }

    async fn chain(model: Arc<dyn LanguageModel>) -> RagChain {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert(&IndexRecord {
                fingerprint: "fp".to_string(),
                source_id: "trees.md".to_string(),
                vector: vec![1.0, 0.0],
                last_synced_at: Utc::now(),
                text: "A binary heap is a complete binary tree.".to_string(),
                chunk_index: 0,
                total_chunks: 1,
                model: "const".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let retriever =
            Retriever::new(store, Arc::new(ConstEmbedder), MmrParams::default()).unwrap();
        RagChain::new(retriever, model, PromptBuilder::new("Tutor."))
    }

    fn model(fragments: Vec<&'static str>, fail: bool) -> Arc<ScriptedModel> {
        Arc::new(ScriptedModel {
            fragments,
            fail,
            prompts: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_completed_turn_is_recorded() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("history.log"));
        let model = model(vec!["A heap ", "is a tree."], false);
        let chain = chain(model.clone()).await;
        let mut session = ChatSession::default();

        let mut streamed = Vec::new();
        let outcome = run_turn(&chain, &mut session, &log, "What is a heap?", None, |f| {
            streamed.push(f.to_string())
        })
        .await
        .unwrap();

        assert_eq!(streamed, vec!["A heap ", "is a tree."]);
        assert_eq!(outcome.turn.assistant, "A heap is a tree.");
        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(session.len(), 3);
        let text = log.read().unwrap();
        assert!(text.contains("What is a heap?"));
        assert!(text.contains("A heap is a tree."));
    }

    #[tokio::test]
    async fn test_failed_turn_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("history.log"));
        let chain = chain(model(vec!["partial"], true)).await;
        let mut session = ChatSession::default();

        let err = run_turn(&chain, &mut session, &log, "q", None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Chain(ChainError::Generation(_))));
        assert_eq!(session.len(), 1);
        assert_eq!(log.read().unwrap(), "");
    }

    #[tokio::test]
    async fn test_second_turn_sees_first() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("history.log"));
        let model = model(vec!["ok"], false);
        let chain = chain(model.clone()).await;
        let mut session = ChatSession::default();

        run_turn(&chain, &mut session, &log, "first", None, |_| {})
            .await
            .unwrap();
        run_turn(&chain, &mut session, &log, "second", None, |_| {})
            .await
            .unwrap();

        let prompts = model.prompts.lock().unwrap();
        let contents: Vec<&str> = prompts[1]
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["How can I help you?", "first", "ok", "second"]);
    }

    #[tokio::test]
    async fn test_cancelled_turn_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("history.log"));
        let chain = chain(Arc::new(StalledModel)).await;
        let mut session = ChatSession::default();

        let mut streamed = Vec::new();
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            run_turn(&chain, &mut session, &log, "What is a heap?", None, |f| {
                streamed.push(f.to_string())
            }),
        )
        .await;

        assert!(result.is_err(), "stalled turn should not complete");
        assert_eq!(streamed, vec!["partial "]);
        assert_eq!(session.len(), 1);
        assert_eq!(log.read().unwrap(), "");
    }
}
