//! Injectable hooks shared by the stages of one subscription graph.
//!
//! A [`Context`] replaces process-wide plugin singletons: it carries the
//! undeliverable-error handler and the [`FlowConfig`], and is handed to every
//! [`Publisher::subscribe`](crate::core::Publisher::subscribe) call so each stage
//! sees the same hooks for the lifetime of the subscription.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::FlowConfig;
use crate::error::Error;

/// Handler invoked with errors that have no legitimate receiver left.
pub type UndeliverableHandler = Arc<dyn Fn(&Error) + Send + Sync>;

struct Inner {
    handler: RwLock<Option<UndeliverableHandler>>,
    config: FlowConfig,
}

/// Cheaply clonable handle to the hooks of a subscription graph.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Create a context with the default configuration and handler.
    pub fn new() -> Self {
        Self::with_config(FlowConfig::default())
    }

    pub fn with_config(config: FlowConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler: RwLock::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.inner.config
    }

    /// Install the undeliverable-error handler. The last registration wins.
    pub fn set_undeliverable_handler<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Restore the default print-and-continue behaviour.
    pub fn reset_undeliverable_handler(&self) {
        *self.inner.handler.write() = None;
    }

    /// Route an error that can no longer be delivered downstream.
    pub fn on_undeliverable(&self, error: Error) {
        let error = match error {
            wrapped @ Error::Undeliverable(_) => wrapped,
            other => Error::Undeliverable(Box::new(other)),
        };

        #[cfg(feature = "metrics")]
        metrics::counter!("fluxweld_undeliverable_errors_total").increment(1);

        let handler = self.inner.handler.read().clone();
        match handler {
            Some(handler) => handler(&error),
            None => tracing::error!(error = %error, label = error.as_label(), "undeliverable error"),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.inner.config)
            .field("custom_handler", &self.inner.handler.read().is_some())
            .finish()
    }
}
