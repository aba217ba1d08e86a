//! Terminal conversation against the engine.
//!
//! Documents are not rendered here: store commands are acknowledged with a `console://` link and
//! emails are reported as sent without leaving the machine. Line-item extraction uses the
//! configured LLM when it is enabled.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use vocario_agent::{DisabledExtractor, HttpLlmClient, LineItemExtraction, LlmLineItemExtractor};
use vocario_core::config::{AppConfig, LoadOptions};
use vocario_core::conversation::CommandStage;
use vocario_core::{Command, ConversationEngine, ConversationId, Inbound, Session, SystemEvent};
use vocario_db::{InMemorySessionStore, SessionStore};

use crate::commands::{runtime, CommandResult, EXIT_CONFIG, EXIT_IO};

const EXIT_WORDS: [&str; 3] = ["quit", "exit", ":q"];

pub struct ConsoleChat {
    engine: ConversationEngine,
    sessions: InMemorySessionStore,
    extractor: Arc<dyn LineItemExtraction>,
    id: ConversationId,
}

impl ConsoleChat {
    pub fn new(
        engine: ConversationEngine,
        extractor: Arc<dyn LineItemExtraction>,
        phone: &str,
    ) -> Self {
        let id = ConversationId(phone.trim().trim_start_matches('+').to_string());
        Self { engine, sessions: InMemorySessionStore::default(), extractor, id }
    }

    /// Feeds one line to the engine and returns every reply it produced, including the ones
    /// triggered by simulated command outcomes.
    pub async fn say(&self, text: &str, received_at: DateTime<Utc>) -> Result<Vec<String>> {
        let stored = self.sessions.get(&self.id).await?;
        let session = stored.unwrap_or_else(|| Session::new(self.id.clone()));

        let transition = self.engine.transition(session, &Inbound::text(text, received_at));
        let mut replies: Vec<String> = transition.reply.into_iter().collect();
        let mut session = transition.session;
        let mut pending: VecDeque<Command> = transition.commands.into();

        while let Some(command) = pending.pop_front() {
            let Some(event) = self.simulate(command).await else {
                continue;
            };
            let transition = self.engine.transition(session, &Inbound::System(event));
            replies.extend(transition.reply);
            pending.extend(transition.commands);
            session = transition.session;
        }

        self.sessions.put(&self.id, session).await?;
        Ok(replies)
    }

    pub async fn session(&self) -> Result<Option<Session>> {
        Ok(self.sessions.get(&self.id).await?)
    }

    async fn simulate(&self, command: Command) -> Option<SystemEvent> {
        match command {
            Command::BuildDocument { .. } => None,
            Command::StoreDocument { artifact, metadata } => Some(SystemEvent::DocumentStored {
                artifact,
                url: format!("console://{}", metadata.filename),
            }),
            Command::SendEmail { document, to, .. } => {
                Some(SystemEvent::EmailSent { document, to })
            }
            Command::ExtractLineItems { text } => Some(match self.extractor.extract(&text).await {
                Ok(items) => SystemEvent::LineItemsExtracted { items },
                Err(error) => SystemEvent::CommandFailed {
                    stage: CommandStage::Extraction,
                    artifact: None,
                    reason: error.to_string(),
                },
            }),
        }
    }
}

/// Reads lines from `input` until EOF or an exit word; returns the number of messages sent.
pub async fn converse<R: BufRead, W: Write>(
    chat: &ConsoleChat,
    input: R,
    output: &mut W,
) -> Result<usize> {
    let mut sent = 0;
    write!(output, "> ")?;
    output.flush()?;
    for line in input.lines() {
        let line = line?;
        let text = line.trim();
        if EXIT_WORDS.contains(&text) {
            break;
        }
        if !text.is_empty() {
            for reply in chat.say(text, Utc::now()).await? {
                writeln!(output, "{reply}\n")?;
            }
            sent += 1;
        }
        write!(output, "> ")?;
        output.flush()?;
    }
    writeln!(output)?;
    Ok(sent)
}

pub fn run(phone: &str) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return CommandResult::config_failure("chat", error),
    };

    let extractor: Arc<dyn LineItemExtraction> = if config.llm.line_item_extraction {
        match HttpLlmClient::from_config(&config.llm) {
            Ok(client) => Arc::new(LlmLineItemExtractor::new(Arc::new(client))),
            Err(error) => {
                return CommandResult::failure("chat", "llm_config", error.to_string(), EXIT_CONFIG);
            }
        }
    } else {
        Arc::new(DisabledExtractor)
    };

    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::runtime_failure("chat", error),
    };

    let engine = ConversationEngine::new(config.engine_settings());
    let chat = ConsoleChat::new(engine, extractor, phone);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    match runtime.block_on(converse(&chat, stdin.lock(), &mut stdout)) {
        Ok(sent) => {
            CommandResult::success("chat", format!("conversation ended after {sent} message(s)"))
        }
        Err(error) => CommandResult::failure("chat", "io", error.to_string(), EXIT_IO),
    }
}
