//! User handler registry.
//!
//! Handlers are async functions keyed by `(contract, event)`. The compiled
//! handler source is an external collaborator; its fingerprint feeds the
//! build id so changing handler code produces a new build.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::event::Event;
use crate::store::{IndexingStore, StoreError};

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Message(String),
}

pub type HandlerResult = Result<(), HandlerError>;

pub type EventHandler =
    Arc<dyn Fn(Event, Arc<IndexingStore>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub struct HandlerRegistry {
    handlers: HashMap<(String, String), EventHandler>,
    fingerprint: String,
}

impl HandlerRegistry {
    /// `fingerprint` identifies the compiled handler source.
    pub fn new(fingerprint: &str) -> Self {
        HandlerRegistry {
            handlers: HashMap::new(),
            fingerprint: fingerprint.to_string(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Register a handler for `contract`'s `event`. Use the event name for
    /// log events, or `"setup"` for the per-contract setup event.
    pub fn on<F>(mut self, contract: &str, event: &str, handler: F) -> Self
    where
        F: Fn(Event, Arc<IndexingStore>) -> BoxFuture<'static, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .insert((contract.to_string(), event.to_string()), Arc::new(handler));
        self
    }

    pub fn get(&self, contract: &str, event: &str) -> Option<EventHandler> {
        self.handlers
            .get(&(contract.to_string(), event.to_string()))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
