//! Replays a JSONL file of transcript events through the coordinator and
//! prints one JSON outcome per event.
//!
//! The language model echoes the user back and speech synthesis only logs, so
//! the tool exercises admission, dedup and timing without external services.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use parley_config::{DedupPolicy, Settings};
use parley_conversation::{
    Collaborators, ConversationCoordinator, GenerateRequest, PublishRequest, StreamingLlmClient,
    TokenStream, TranscriptEvent, TtsClient,
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "parley-replay", about = "Replay transcript events through the turn-taking pipeline")]
struct Args {
    /// JSONL file with one transcript event per line
    #[arg(long)]
    events: PathBuf,

    /// TOML settings file; PARLEY__* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Partial/final dedup policy, overriding the settings
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Ignore event timestamps and replay back to back
    #[arg(long)]
    no_delay: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    CancelAndResupersede,
    BlockFinal,
}

impl From<PolicyArg> for DedupPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::CancelAndResupersede => DedupPolicy::CancelAndResupersede,
            PolicyArg::BlockFinal => DedupPolicy::BlockFinal,
        }
    }
}

/// Streams "You said: <text>" back one word at a time.
struct EchoLlm {
    token_delay: Duration,
}

#[async_trait]
impl StreamingLlmClient for EchoLlm {
    async fn generate(&self, request: GenerateRequest) -> anyhow::Result<TokenStream> {
        let reply = format!("You said: {}.", request.text.trim_end_matches(['.', '?', '!']));
        let tokens: Vec<String> = reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.token_delay;
        Ok(futures::stream::iter(tokens)
            .then(move |token| async move {
                tokio::time::sleep(delay).await;
                Ok(token)
            })
            .boxed())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Logs each phrase and takes time proportional to its length.
struct LogTts;

#[async_trait]
impl TtsClient for LogTts {
    async fn publish(&self, request: PublishRequest) -> anyhow::Result<()> {
        info!(room = %request.room, language = %request.language, text = %request.text, "Speaking");
        tokio::time::sleep(Duration::from_millis(5 * request.text.len() as u64)).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[derive(Serialize)]
struct ReplayLine<'a> {
    participant_id: &'a str,
    utterance_id: &'a str,
    is_partial: bool,
    sequence: u64,
    #[serde(flatten)]
    result: ReplayResult,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ReplayResult {
    Outcome(parley_conversation::ProcessOutcome),
    Rejected { error: String, status_code: u16 },
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    // Logs go to stderr so stdout stays machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if settings.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn read_events(path: &PathBuf) -> anyhow::Result<Vec<TranscriptEvent>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut events = Vec::new();
    let mut line_no = 0;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: TranscriptEvent = serde_json::from_str(&line)
            .with_context(|| format!("Invalid event on line {line_no}"))?;
        events.push(event);
    }
    events.sort_by_key(|event| event.timestamp);
    Ok(events)
}

/// Wall-clock wait between two consecutive events; none for the first one.
fn replay_gap(previous: Option<DateTime<Utc>>, current: DateTime<Utc>) -> Option<Duration> {
    previous.and_then(|previous| (current - previous).to_std().ok())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(policy) = args.policy {
        settings.coordinator.dedup_policy = policy.into();
    }
    init_tracing(&settings);

    let events = read_events(&args.events).await?;
    info!(count = events.len(), path = %args.events.display(), "Replaying events");

    let collaborators = Collaborators::new(
        Arc::new(EchoLlm {
            token_delay: Duration::from_millis(20),
        }),
        Arc::new(LogTts),
    );
    let coordinator = ConversationCoordinator::new(settings, collaborators);
    let sweeper_cancel = CancellationToken::new();
    let sweeper = coordinator.spawn_sweeper(sweeper_cancel.clone());

    let mut running = JoinSet::new();
    let mut previous: Option<DateTime<Utc>> = None;
    for event in events {
        if !args.no_delay
            && let Some(gap) = replay_gap(previous, event.timestamp)
        {
            tokio::time::sleep(gap).await;
        }
        previous = Some(event.timestamp);

        let coordinator = Arc::clone(&coordinator);
        running.spawn(async move {
            let result = match coordinator.handle_event(event.clone()).await {
                Ok(outcome) => ReplayResult::Outcome(outcome),
                Err(err) => ReplayResult::Rejected {
                    status_code: err.status_code(),
                    error: err.to_string(),
                },
            };
            let line = ReplayLine {
                participant_id: &event.participant_id,
                utterance_id: &event.utterance_id,
                is_partial: event.is_partial,
                sequence: event.sequence,
                result,
            };
            match serde_json::to_string(&line) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "Failed to serialize outcome"),
            }
        });
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Replay task failed");
        }
    }

    coordinator.shutdown().await;
    sweeper_cancel.cancel();
    sweeper.await?;
    info!(stats = ?coordinator.tts_queue().get_global_stats(), "Replay finished");
    Ok(())
}
