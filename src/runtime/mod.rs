//! Generic service runtime: one LISTEN/NOTIFY event loop per service.
//!
//! A [`Service`] reacts to channel notifications and poll timeouts; the
//! [`ServiceRuntime`] owns the listener loop, the cold-start tick, and the
//! periodic-work gate, so services only implement domain callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::{Result, TaskerError};
use crate::notify::{ChangeFeedListener, FeedEvent};

/// Domain callbacks driven by the runtime loop.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Channels the runtime subscribes to on behalf of this service.
    fn channels(&self) -> Vec<String>;

    /// Runs once after the listener is connected, before the first event.
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// A notification arrived on one of the subscribed channels.
    async fn on_notify(&self, channel: &str, payload: &str) -> Result<()>;

    /// The poll window elapsed without traffic. `first_tick` is true exactly
    /// once, on the first timeout after startup, so a service can recover
    /// work that predates its subscription.
    async fn on_timeout(&self, first_tick: bool) -> Result<()>;

    /// Whether periodic work is due. Checked after every loop turn.
    fn is_period_due(&self) -> bool {
        false
    }

    async fn on_periodic(&self) -> Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Yields true exactly once, on the first call.
#[derive(Debug)]
pub struct FirstTickGate {
    armed: AtomicBool,
}

impl FirstTickGate {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(true),
        }
    }

    pub fn take(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }
}

impl Default for FirstTickGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a [`Service`] against a change-feed listener until shutdown.
pub struct ServiceRuntime<S: Service> {
    service: S,
    listener: ChangeFeedListener,
    first_tick: FirstTickGate,
}

impl<S: Service> ServiceRuntime<S> {
    pub fn new(service: S, listener: ChangeFeedListener) -> Self {
        Self {
            service,
            listener,
            first_tick: FirstTickGate::new(),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn shutdown_handle(&self) -> std::sync::Arc<tokio::sync::Notify> {
        self.listener.shutdown_handle()
    }

    /// The event loop. Callback errors are logged and the loop continues; a
    /// transport error from the listener ends the loop.
    pub async fn run(&mut self) -> Result<()> {
        self.listener.connect().await?;
        info!(service = self.service.name(), "service starting");
        self.service.on_start().await?;

        loop {
            match self.listener.next_event().await? {
                FeedEvent::Notification { channel, payload } => {
                    if let Err(e) = self.service.on_notify(&channel, &payload).await {
                        error!(
                            service = self.service.name(),
                            channel = %channel,
                            error = %e,
                            "notification handler failed"
                        );
                    }
                }
                FeedEvent::Timeout => {
                    let first_tick = self.first_tick.take();
                    if let Err(e) = self.service.on_timeout(first_tick).await {
                        error!(
                            service = self.service.name(),
                            error = %e,
                            "timeout handler failed"
                        );
                    }
                }
                FeedEvent::Shutdown => break,
            }

            if self.service.is_period_due() {
                if let Err(e) = self.service.on_periodic().await {
                    error!(
                        service = self.service.name(),
                        error = %e,
                        "periodic handler failed"
                    );
                }
            }
        }

        info!(service = self.service.name(), "service stopping");
        self.service.on_shutdown().await
    }
}

/// Method-name dispatch table for inbound `task` messages.
pub struct HandlerRegistry<H> {
    handlers: HashMap<String, H>,
}

impl<H> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Duplicate names are a startup configuration error.
    pub fn register(&mut self, name: impl Into<String>, handler: H) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(TaskerError::Configuration(format!(
                "duplicate handler registration: {name}"
            )));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Resolve a method name; unknown methods are a validation error the
    /// caller answers with an error reply.
    pub fn resolve(&self, name: &str) -> Result<&H> {
        self.handlers.get(name).ok_or_else(|| {
            warn!(method = %name, "unknown method requested");
            TaskerError::Validation(format!("unknown method: {name}"))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl<H> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_gate_fires_once() {
        let gate = FirstTickGate::new();
        assert!(gate.take());
        assert!(!gate.take());
        assert!(!gate.take());
    }

    #[test]
    fn test_registry_resolves_registered_handler() {
        let mut registry: HandlerRegistry<u32> = HandlerRegistry::new();
        registry.register("generate", 1).unwrap();
        registry.register("cancel", 2).unwrap();
        assert_eq!(*registry.resolve("generate").unwrap(), 1);
        assert_eq!(*registry.resolve("cancel").unwrap(), 2);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry: HandlerRegistry<u32> = HandlerRegistry::new();
        registry.register("generate", 1).unwrap();
        let err = registry.register("generate", 2).unwrap_err();
        assert!(matches!(err, TaskerError::Configuration(_)));
    }

    #[test]
    fn test_registry_unknown_method_is_validation_error() {
        let registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let err = registry.resolve("nope").unwrap_err();
        assert!(matches!(err, TaskerError::Validation(_)));
        assert!(err.is_business());
    }
}
