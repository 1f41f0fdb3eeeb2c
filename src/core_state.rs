//! Shared service state.
//!
//! `CoreState` is built once at startup, wrapped in `Arc`, and shared by the
//! axum handlers and the background confirmation scheduler. It holds no
//! connection: each request or task opens its own through [`CoreState::open_db`].

use std::sync::Arc;

use rusqlite::Connection;

use crate::audit::AuditSink;
use crate::automation::FlowEngine;
use crate::config::ClinicConfig;
use crate::conversation::SessionManager;
use crate::db::{self, Database};
use crate::messaging::transport::{transport_from_config, MessageTransport, TransportError};
use crate::triage::generation::{
    DisabledGenerationClient, GenerationClient, GenerationError, HttpGenerationClient,
};
use crate::triage::ResponseGenerator;

pub struct CoreState {
    database: Database,
    config: ClinicConfig,
    generator: ResponseGenerator,
    transport: Arc<dyn MessageTransport>,
    audit: Arc<dyn AuditSink>,
}

impl CoreState {
    pub fn new(
        database: Database,
        config: ClinicConfig,
        generator: ResponseGenerator,
        transport: Arc<dyn MessageTransport>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            database,
            config,
            generator,
            transport,
            audit,
        }
    }

    /// Wire the production collaborators described by `config`.
    pub fn from_config(
        database: Database,
        config: ClinicConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, CoreError> {
        let client: Arc<dyn GenerationClient> = match (&config.ai.generation_url, config.ai.enabled) {
            (Some(url), true) => {
                tracing::info!(url = %url, model = %config.ai.generation_model, "Generation enabled");
                Arc::new(HttpGenerationClient::new(
                    url,
                    &config.ai.generation_model,
                    config.ai.generation_timeout,
                )?)
            }
            _ => {
                tracing::info!("No generation endpoint; replies use templates");
                Arc::new(DisabledGenerationClient)
            }
        };
        let generator =
            ResponseGenerator::new(client, config.clinic.clone(), config.ai.generation_timeout);
        let transport = transport_from_config(&config.whatsapp)?;
        Ok(Self::new(database, config, generator, transport, audit))
    }

    /// Open a database connection. One per request or task; never held
    /// across an `.await`.
    pub fn open_db(&self) -> Result<Connection, CoreError> {
        Ok(self.database.connect()?)
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn config(&self) -> &ClinicConfig {
        &self.config
    }

    pub fn generator(&self) -> &ResponseGenerator {
        &self.generator
    }

    /// Owned handle, for dispatch tasks that outlive the request.
    pub fn transport(&self) -> Arc<dyn MessageTransport> {
        Arc::clone(&self.transport)
    }

    pub fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    pub fn audit_handle(&self) -> Arc<dyn AuditSink> {
        Arc::clone(&self.audit)
    }

    pub fn flow_engine<'a>(&'a self, conn: &'a Connection) -> FlowEngine<'a> {
        FlowEngine::new(conn, self.audit.as_ref(), self.config.step_failure_policy)
    }

    pub fn sessions<'a>(&self, conn: &'a Connection) -> SessionManager<'a> {
        SessionManager::new(conn, self.config.conversation_window)
    }
}

/// Errors from CoreState operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] db::DatabaseError),
    #[error("Generation client error: {0}")]
    Generation(#[from] GenerationError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// State over a temporary database with scripted collaborators.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::CoreState;
    use crate::audit::MemoryAuditSink;
    use crate::config::ClinicConfig;
    use crate::db::Database;
    use crate::messaging::transport::RecordingTransport;
    use crate::triage::generation::MockGenerationClient;
    use crate::triage::ResponseGenerator;

    pub struct TestState {
        pub state: Arc<CoreState>,
        pub transport: Arc<RecordingTransport>,
        pub audit: Arc<MemoryAuditSink>,
        _dir: TempDir,
    }

    pub fn test_state(
        config: ClinicConfig,
        client: MockGenerationClient,
        transport: RecordingTransport,
    ) -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::initialize(&dir.path().join("clinic.db")).unwrap();
        let generator = ResponseGenerator::new(
            Arc::new(client),
            config.clinic.clone(),
            Duration::from_millis(200),
        );
        let transport = Arc::new(transport);
        let audit = Arc::new(MemoryAuditSink::new());
        let state = CoreState::new(database, config, generator, transport.clone(), audit.clone());
        TestState {
            state: Arc::new(state),
            transport,
            audit,
            _dir: dir,
        }
    }
}
