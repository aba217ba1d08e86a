use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use vocario_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use vocario_core::conversation::{render, ConversationEngine, ConversationId, Inbound, Session};
use vocario_db::{RepositoryError, SessionStore};
use vocario_whatsapp::{
    mask_phone, DeliveryChannel, EventContext, HandlerError, HandlerResult, InboundEnvelope,
    MessageHandler,
};

use crate::executor::CommandExecutor;

/// System events that trigger further commands are followed at most this many rounds deep.
const MAX_FEEDBACK_ROUNDS: usize = 8;

/// Runs the conversation for each WhatsApp number: loads the session, applies the engine,
/// executes the emitted commands and feeds their outcomes back until nothing is left to do.
pub struct ConversationHost {
    engine: ConversationEngine,
    sessions: Arc<dyn SessionStore>,
    delivery: Arc<dyn DeliveryChannel>,
    executor: CommandExecutor,
    audit: Arc<dyn AuditSink>,
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationHost {
    pub fn new(
        engine: ConversationEngine,
        sessions: Arc<dyn SessionStore>,
        delivery: Arc<dyn DeliveryChannel>,
        executor: CommandExecutor,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { engine, sessions, delivery, executor, audit, locks: Mutex::new(HashMap::new()) }
    }

    /// Per-number lock; entries nobody holds are pruned on the way.
    async fn lock_for(&self, id: &ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id.clone()).or_default().clone()
    }

    async fn apply(
        &self,
        session: Session,
        inbound: &Inbound,
        audit: &AuditContext,
    ) -> (Session, Vec<vocario_core::Command>) {
        let transition =
            self.engine.transition_with_audit(session, inbound, self.audit.as_ref(), audit);
        if transition.is_defect() {
            error!(
                event_name = "host.conversation.defect",
                correlation_id = %audit.correlation_id,
                error = ?transition.error,
                "conversation reset after an invariant violation"
            );
        }
        if let Some(reply) = transition.reply.as_deref() {
            self.reply(&transition.session.id, reply, &audit.correlation_id).await;
        }
        (transition.session, transition.commands)
    }

    async fn reply(&self, to: &ConversationId, text: &str, correlation_id: &str) {
        if let Err(error) = self.delivery.send(to, text).await {
            warn!(
                event_name = "host.reply.failed",
                correlation_id,
                conversation_id = %mask_phone(&to.0),
                error = %error,
                "reply could not be delivered"
            );
        }
    }

    async fn save(&self, session: &Session) -> Result<(), HandlerError> {
        self.sessions.put(&session.id, session.clone()).await.map_err(storage)
    }

    /// Replaces a stored session that no longer decodes with a fresh one at the main menu.
    async fn recover_unreadable(
        &self,
        id: &ConversationId,
        reason: &str,
        audit: &AuditContext,
    ) -> Result<(), HandlerError> {
        error!(
            event_name = "host.session.unreadable",
            correlation_id = %audit.correlation_id,
            conversation_id = %mask_phone(&id.0),
            error = %reason,
            "stored session could not be decoded, starting over"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(id.clone()),
                None,
                audit.correlation_id.clone(),
                "conversation.session_discarded",
                AuditCategory::Persistence,
                audit.actor.clone(),
                AuditOutcome::Failed,
            )
            .with_metadata("error", reason),
        );

        self.save(&Session::new(id.clone())).await?;
        let reply = format!("{}\n\n{}", render::GENERIC_FAILURE, render::main_menu());
        self.reply(id, &reply, &audit.correlation_id).await;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ConversationHost {
    async fn handle(
        &self,
        envelope: &InboundEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, HandlerError> {
        let id = &envelope.conversation;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let audit =
            AuditContext::new(Some(id.clone()), None, ctx.correlation_id.clone(), "whatsapp");
        let session = match self.sessions.get(id).await {
            Ok(stored) => stored.unwrap_or_else(|| Session::new(id.clone())),
            Err(RepositoryError::Decode(reason)) => {
                self.recover_unreadable(id, &reason, &audit).await?;
                return Ok(HandlerResult::Processed);
            }
            Err(other) => return Err(storage(other)),
        };
        let inbound = Inbound::text(envelope.text.clone(), envelope.received_at);

        let (mut session, mut commands) = self.apply(session, &inbound, &audit).await;
        self.save(&session).await?;

        let mut rounds = 0;
        while !commands.is_empty() {
            if rounds == MAX_FEEDBACK_ROUNDS {
                error!(
                    event_name = "host.commands.abandoned",
                    correlation_id = %ctx.correlation_id,
                    pending = commands.len(),
                    "command feedback did not settle"
                );
                break;
            }
            rounds += 1;

            let events = self.executor.execute(commands, &ctx.correlation_id).await;
            commands = Vec::new();
            for event in events {
                let (next, more) = self.apply(session, &Inbound::System(event), &audit).await;
                session = next;
                commands.extend(more);
            }
            self.save(&session).await?;
        }

        info!(
            event_name = "host.conversation.processed",
            correlation_id = %ctx.correlation_id,
            conversation_id = %mask_phone(&id.0),
            state = session.state.name(),
            "message processed"
        );
        Ok(HandlerResult::Processed)
    }
}

fn storage(error: RepositoryError) -> HandlerError {
    HandlerError::Storage(error.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use vocario_agent::DisabledExtractor;
    use vocario_core::audit::{AuditOutcome, InMemoryAuditSink};
    use vocario_core::conversation::render::GENERIC_FAILURE;
    use vocario_core::conversation::{
        ConversationEngine, ConversationId, ConversationState, Session,
    };
    use vocario_core::domain::document::{ArtifactState, DocumentStatus};
    use vocario_core::DocumentFormat;
    use vocario_db::{InMemorySessionStore, RepositoryError, SessionStore};
    use vocario_whatsapp::{
        EventContext, HandlerResult, InMemoryDelivery, InboundEnvelope, MessageHandler,
        RetryPolicy,
    };

    use super::ConversationHost;
    use crate::executor::tests::{FakeBuilder, FlakyArchive, RecordingEmail};
    use crate::executor::{CommandExecutor, ExecutorSettings};

    struct Harness {
        host: ConversationHost,
        sessions: Arc<InMemorySessionStore>,
        delivery: Arc<InMemoryDelivery>,
        email: Arc<RecordingEmail>,
        audit: InMemoryAuditSink,
    }

    fn harness(builder: FakeBuilder) -> Harness {
        let sessions = Arc::new(InMemorySessionStore::default());
        let delivery = Arc::new(InMemoryDelivery::default());
        let email = Arc::new(RecordingEmail::default());
        let audit = InMemoryAuditSink::default();
        let executor = CommandExecutor::new(
            Arc::new(builder),
            Arc::new(FlakyArchive::default()),
            email.clone(),
            Arc::new(DisabledExtractor),
            ExecutorSettings { store_retry: RetryPolicy::immediate(0), ..Default::default() },
        );
        let host = ConversationHost::new(
            ConversationEngine::default(),
            sessions.clone(),
            delivery.clone(),
            executor,
            Arc::new(audit.clone()),
        );
        Harness { host, sessions, delivery, email, audit }
    }

    fn id() -> ConversationId {
        ConversationId("33612345678".to_owned())
    }

    async fn say(host: &ConversationHost, text: &str) -> HandlerResult {
        let envelope = InboundEnvelope {
            message_sid: None,
            conversation: id(),
            text: text.to_owned(),
            profile_name: None,
            received_at: Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).single().expect("timestamp"),
        };
        let ctx = EventContext { correlation_id: format!("test-{text}") };
        host.handle(&envelope, &ctx).await.expect("handled")
    }

    #[tokio::test]
    async fn first_message_creates_and_persists_a_session() {
        let harness = harness(FakeBuilder::default());

        assert_eq!(say(&harness.host, "bonjour").await, HandlerResult::Processed);

        let session = harness.sessions.get(&id()).await.expect("get").expect("stored session");
        assert_eq!(session.state, ConversationState::MainMenu);
        let replies = harness.delivery.replies_to(&id()).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(harness.audit.events().len(), 1);
    }

    #[tokio::test]
    async fn finalized_quote_is_built_stored_emailed_and_linked() {
        let harness = harness(FakeBuilder::default());
        let texts = ["devis", "Dupont", "0612345678", "peinture forfait 800€", "2", "3"];
        for text in texts.into_iter().chain(["client@exemple.fr"]) {
            say(&harness.host, text).await;
        }

        say(&harness.host, "1").await;

        let session = harness.sessions.get(&id()).await.expect("get").expect("stored session");
        let record = &session.documents[0];
        assert!(matches!(
            record.artifacts.get(&DocumentFormat::Pdf),
            Some(ArtifactState::Ready { url }) if url.ends_with("DEV-20260115-0001.pdf")
        ));
        assert_eq!(record.status, DocumentStatus::Sent);
        assert_eq!(harness.email.sent.lock().await.len(), 1);

        let replies = harness.delivery.replies_to(&id()).await;
        assert!(replies.iter().any(|reply| reply.contains("prêt")));
        assert!(replies.iter().any(|reply| reply.contains("client@exemple.fr")));
    }

    #[tokio::test]
    async fn build_failures_mark_the_artifact_and_tell_the_user() {
        let harness = harness(FakeBuilder { fail: true });
        for text in ["1", "Dupont", "non", "dépose forfait 350€", "2", "1"] {
            say(&harness.host, text).await;
        }

        let session = harness.sessions.get(&id()).await.expect("get").expect("stored session");
        assert!(matches!(
            session.documents[0].artifacts.get(&DocumentFormat::Pdf),
            Some(ArtifactState::Failed { .. })
        ));
        let replies = harness.delivery.replies_to(&id()).await;
        assert!(replies.last().is_some_and(|reply| reply.contains("n'a pas pu être généré")));
    }

    #[tokio::test]
    async fn different_numbers_keep_separate_sessions() {
        let harness = harness(FakeBuilder::default());
        say(&harness.host, "1").await;

        let other = ConversationId("33700000000".to_owned());
        let envelope = InboundEnvelope {
            message_sid: None,
            conversation: other.clone(),
            text: "menu".to_owned(),
            profile_name: None,
            received_at: Utc::now(),
        };
        harness.host.handle(&envelope, &EventContext::default()).await.expect("handled");

        let first = harness.sessions.get(&id()).await.expect("get").expect("first");
        let second = harness.sessions.get(&other).await.expect("get").expect("second");
        assert_ne!(first.state, ConversationState::MainMenu);
        assert_eq!(second.state, ConversationState::MainMenu);
    }

    /// Session store whose stored rows predate the current state format.
    #[derive(Default)]
    struct StaleFormatStore {
        inner: InMemorySessionStore,
        stale: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for StaleFormatStore {
        async fn get(&self, id: &ConversationId) -> Result<Option<Session>, RepositoryError> {
            if self.stale.load(Ordering::SeqCst) {
                return Err(RepositoryError::Decode("unknown variant `devis_photo`".to_owned()));
            }
            self.inner.get(id).await
        }

        async fn put(&self, id: &ConversationId, session: Session) -> Result<(), RepositoryError> {
            self.stale.store(false, Ordering::SeqCst);
            self.inner.put(id, session).await
        }

        async fn delete(&self, id: &ConversationId) -> Result<(), RepositoryError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn undecodable_sessions_restart_at_the_main_menu() {
        let sessions = Arc::new(StaleFormatStore::default());
        sessions.stale.store(true, Ordering::SeqCst);
        let delivery = Arc::new(InMemoryDelivery::default());
        let audit = InMemoryAuditSink::default();
        let executor = CommandExecutor::new(
            Arc::new(FakeBuilder::default()),
            Arc::new(FlakyArchive::default()),
            Arc::new(RecordingEmail::default()),
            Arc::new(DisabledExtractor),
            ExecutorSettings::default(),
        );
        let host = ConversationHost::new(
            ConversationEngine::default(),
            sessions.clone(),
            delivery.clone(),
            executor,
            Arc::new(audit.clone()),
        );

        assert_eq!(say(&host, "2").await, HandlerResult::Processed);

        let session = sessions.get(&id()).await.expect("readable again").expect("fresh session");
        assert_eq!(session.state, ConversationState::MainMenu);
        assert!(session.documents.is_empty());
        let replies = delivery.replies_to(&id()).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with(GENERIC_FAILURE));
        assert!(audit.events().iter().any(|event| {
            event.event_type == "conversation.session_discarded"
                && event.outcome == AuditOutcome::Failed
        }));

        say(&host, "1").await;
        let session = sessions.get(&id()).await.expect("get").expect("stored session");
        assert_ne!(session.state, ConversationState::MainMenu);
    }

    #[tokio::test]
    async fn other_storage_failures_still_surface() {
        struct Offline;

        #[async_trait]
        impl SessionStore for Offline {
            async fn get(&self, _: &ConversationId) -> Result<Option<Session>, RepositoryError> {
                Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
            }

            async fn put(&self, _: &ConversationId, _: Session) -> Result<(), RepositoryError> {
                Ok(())
            }

            async fn delete(&self, _: &ConversationId) -> Result<(), RepositoryError> {
                Ok(())
            }
        }

        let host = ConversationHost::new(
            ConversationEngine::default(),
            Arc::new(Offline),
            Arc::new(InMemoryDelivery::default()),
            CommandExecutor::new(
                Arc::new(FakeBuilder::default()),
                Arc::new(FlakyArchive::default()),
                Arc::new(RecordingEmail::default()),
                Arc::new(DisabledExtractor),
                ExecutorSettings::default(),
            ),
            Arc::new(InMemoryAuditSink::default()),
        );
        let envelope = InboundEnvelope {
            message_sid: None,
            conversation: id(),
            text: "menu".to_owned(),
            profile_name: None,
            received_at: Utc::now(),
        };

        assert!(host.handle(&envelope, &EventContext::default()).await.is_err());
    }
}
