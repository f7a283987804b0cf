use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use mu_core::CommandRecord;

/// Auditable side effect emitted by a mutation handler. Each one becomes a
/// `domain.mutating` journal entry, appended before the command's final
/// lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayMutationEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl ReplayMutationEvent {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
        }
    }
}

/// What a domain handler resolved to. Readonly handlers only ever produce
/// `Completed` or `Failed` with no events.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Completed {
        result: serde_json::Value,
        error_code: Option<String>,
        events: Vec<ReplayMutationEvent>,
    },
    Failed {
        error_code: String,
        events: Vec<ReplayMutationEvent>,
    },
    Cancelled {
        error_code: Option<String>,
        events: Vec<ReplayMutationEvent>,
    },
    Deferred {
        retry_at_ms: i64,
        error_code: Option<String>,
        events: Vec<ReplayMutationEvent>,
    },
}

impl HandlerOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        HandlerOutcome::Completed {
            result,
            error_code: None,
            events: Vec::new(),
        }
    }

    pub fn completed_with_events(
        result: serde_json::Value,
        events: Vec<ReplayMutationEvent>,
    ) -> Self {
        HandlerOutcome::Completed {
            result,
            error_code: None,
            events,
        }
    }

    pub fn failed(error_code: &str) -> Self {
        HandlerOutcome::Failed {
            error_code: error_code.to_string(),
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[ReplayMutationEvent] {
        match self {
            HandlerOutcome::Completed { events, .. }
            | HandlerOutcome::Failed { events, .. }
            | HandlerOutcome::Cancelled { events, .. }
            | HandlerOutcome::Deferred { events, .. } => events,
        }
    }
}

/// One domain handler, keyed by `target_type`. Handlers run inside the
/// serialized lane — they must not re-enter it and must not block on other
/// lane work.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome;
}

/// target_type → handler. Clones share one table, so hosts may register a
/// handler after the pipeline holds the registry (the status builtin needs
/// state that only exists once the pipeline does).
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<std::sync::RwLock<HashMap<String, Arc<dyn CommandHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target_type: &str, handler: Arc<dyn CommandHandler>) -> &Self {
        self.handlers
            .write()
            .unwrap()
            .insert(target_type.to_string(), handler);
        self
    }

    pub fn get(&self, target_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.read().unwrap().get(target_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
