use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use vocario_agent::LineItemExtraction;
use vocario_core::conversation::{
    ArchiveMetadata, ArtifactRef, Command, CommandStage, EmailAttachment, SystemEvent,
};
use vocario_core::{DocumentId, DocumentRecord};
use vocario_whatsapp::RetryPolicy;

use crate::archive::DocumentArchive;
use crate::builder::DocumentBuilder;
use crate::email::{EmailSender, OutgoingEmail, RemoteAttachment};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub call_timeout: Duration,
    pub store_retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { call_timeout: Duration::from_secs(30), store_retry: RetryPolicy::default() }
    }
}

/// Runs the commands of one transition in emission order and reports each outcome as the
/// system event the engine expects back.
pub struct CommandExecutor {
    builder: Arc<dyn DocumentBuilder>,
    archive: Arc<dyn DocumentArchive>,
    email: Arc<dyn EmailSender>,
    extractor: Arc<dyn LineItemExtraction>,
    settings: ExecutorSettings,
}

/// Per-batch bookkeeping: bytes waiting for their store step, links produced so far, and
/// artifacts whose chain already failed.
#[derive(Default)]
struct Batch {
    built: HashMap<ArtifactRef, Vec<u8>>,
    stored: HashMap<ArtifactRef, String>,
    failed: HashSet<ArtifactRef>,
}

struct EmailRequest {
    document: DocumentId,
    to: String,
    subject: String,
    body: String,
    attachment: Option<EmailAttachment>,
}

impl CommandExecutor {
    pub fn new(
        builder: Arc<dyn DocumentBuilder>,
        archive: Arc<dyn DocumentArchive>,
        email: Arc<dyn EmailSender>,
        extractor: Arc<dyn LineItemExtraction>,
        settings: ExecutorSettings,
    ) -> Self {
        Self { builder, archive, email, extractor, settings }
    }

    pub async fn execute(&self, commands: Vec<Command>, correlation_id: &str) -> Vec<SystemEvent> {
        let mut batch = Batch::default();
        let mut events = Vec::new();
        for command in commands {
            info!(
                event_name = "host.command.started",
                correlation_id,
                command = command.name(),
                "executing command"
            );
            let event = match command {
                Command::BuildDocument { artifact, document } => {
                    self.build(&mut batch, artifact, &document).await
                }
                Command::StoreDocument { artifact, metadata } => {
                    self.store(&mut batch, artifact, &metadata).await
                }
                Command::SendEmail { document, to, subject, body, attachment } => {
                    let request = EmailRequest { document, to, subject, body, attachment };
                    self.send_email(&batch, request).await
                }
                Command::ExtractLineItems { text } => Some(self.extract(&text).await),
            };
            let Some(event) = event else {
                continue;
            };
            if let SystemEvent::CommandFailed { stage, reason, .. } = &event {
                warn!(
                    event_name = "host.command.failed",
                    correlation_id,
                    stage = ?stage,
                    reason = %reason,
                    "command failed"
                );
            }
            events.push(event);
        }
        events
    }

    /// Successful builds stay silent; the matching store reports the outcome.
    async fn build(
        &self,
        batch: &mut Batch,
        artifact: ArtifactRef,
        document: &DocumentRecord,
    ) -> Option<SystemEvent> {
        let build = self.builder.build(document, artifact.format);
        match bounded(self.settings.call_timeout, build).await {
            Ok(bytes) => {
                batch.built.insert(artifact, bytes);
                None
            }
            Err(reason) => {
                batch.failed.insert(artifact.clone());
                Some(failed(CommandStage::Build, Some(artifact), reason))
            }
        }
    }

    async fn store(
        &self,
        batch: &mut Batch,
        artifact: ArtifactRef,
        metadata: &ArchiveMetadata,
    ) -> Option<SystemEvent> {
        if batch.failed.contains(&artifact) {
            return None;
        }
        let Some(bytes) = batch.built.remove(&artifact) else {
            batch.failed.insert(artifact.clone());
            return Some(failed(
                CommandStage::Store,
                Some(artifact),
                "no rendered bytes for this artifact".to_owned(),
            ));
        };

        let policy = &self.settings.store_retry;
        let mut attempt = 0;
        loop {
            let store = self.archive.store(&bytes, metadata);
            match bounded(self.settings.call_timeout, store).await {
                Ok(url) => {
                    batch.stored.insert(artifact.clone(), url.clone());
                    return Some(SystemEvent::DocumentStored { artifact, url });
                }
                Err(reason) if attempt < policy.max_retries => {
                    warn!(
                        event_name = "host.store.retry",
                        attempt,
                        number = %metadata.number,
                        reason = %reason,
                        "archive store failed; retrying"
                    );
                    policy.wait(attempt).await;
                    attempt += 1;
                }
                Err(reason) => {
                    batch.failed.insert(artifact.clone());
                    return Some(failed(CommandStage::Store, Some(artifact), reason));
                }
            }
        }
    }

    /// Emails whose pending attachment failed upstream are dropped: the failure was already
    /// reported by the build or store step.
    async fn send_email(&self, batch: &Batch, request: EmailRequest) -> Option<SystemEvent> {
        let EmailRequest { document, to, subject, body, attachment } = request;
        let mut artifact = None;
        let attachment = match attachment {
            None => None,
            Some(EmailAttachment::Archived { url, filename }) => {
                Some(RemoteAttachment { filename, path: url })
            }
            Some(EmailAttachment::Pending { artifact: pending, filename }) => {
                if batch.failed.contains(&pending) {
                    return None;
                }
                let Some(url) = batch.stored.get(&pending).cloned() else {
                    return Some(failed(
                        CommandStage::Email,
                        Some(pending),
                        "attachment was not stored before the email".to_owned(),
                    ));
                };
                artifact = Some(pending);
                Some(RemoteAttachment { filename, path: url })
            }
        };

        let email = OutgoingEmail { to, subject, body, attachment };
        match bounded(self.settings.call_timeout, self.email.send(&email)).await {
            Ok(()) => Some(SystemEvent::EmailSent { document, to: email.to }),
            Err(reason) => Some(failed(CommandStage::Email, artifact, reason)),
        }
    }

    async fn extract(&self, text: &str) -> SystemEvent {
        match bounded(self.settings.call_timeout, self.extractor.extract(text)).await {
            Ok(items) => SystemEvent::LineItemsExtracted { items },
            Err(reason) => failed(CommandStage::Extraction, None, reason),
        }
    }
}

fn failed(stage: CommandStage, artifact: Option<ArtifactRef>, reason: String) -> SystemEvent {
    SystemEvent::CommandFailed { stage, artifact, reason }
}

/// Awaits `call` for at most `limit`, flattening timeouts and call errors into a reason.
async fn bounded<F, T, E>(limit: Duration, call: F) -> Result<T, String>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
    }
}
