// src/ipc/dispatch.rs

//! Command and event dispatch groups.
//!
//! Grounded in original `commands.py`/`events.py`: a `CommandGroup` maps a
//! name to exactly one handler (registering a duplicate name is an error),
//! while an `EventGroup` accumulates every handler registered under a name
//! and runs them all. Dispatching a command that panics is reported back
//! to the caller as a traceback string rather than killing the connection.

use crate::error::FleetError;
use crate::ipc::payload::Uid;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A single command handler. Returns the JSON value to send back as
/// `ResponseOk`, or a `FleetError` which is reported as `ResponseTraceback`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, author: Uid, data: Value) -> Result<Value, FleetError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Uid, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, FleetError>> + Send,
{
    async fn call(&self, author: Uid, data: Value) -> Result<Value, FleetError> {
        (self)(author, data).await
    }
}

/// The outcome of dispatching a single command by name.
pub enum CommandOutcome {
    Ok(Value),
    Traceback(String),
    NotFound,
}

/// Registry of named command handlers, each name unique.
#[derive(Default, Clone)]
pub struct CommandGroup {
    handlers: Arc<std::sync::RwLock<HashMap<String, Arc<dyn CommandHandler>>>>,
}

impl CommandGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<(), FleetError> {
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&name) {
            return Err(FleetError::CommandAlreadyExists(name));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    /// Look up and invoke `name`, catching panics the way the original
    /// wraps every command call in `try/except`.
    pub async fn dispatch(&self, name: &str, author: Uid, data: Value) -> CommandOutcome {
        let handler = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(name).cloned()
        };
        let Some(handler) = handler else {
            return CommandOutcome::NotFound;
        };

        match AssertUnwindSafe(handler.call(author, data)).catch_unwind().await {
            Ok(Ok(value)) => CommandOutcome::Ok(value),
            Ok(Err(e)) => CommandOutcome::Traceback(e.to_string()),
            Err(panic) => {
                let message = panic_message(&panic);
                CommandOutcome::Traceback(message)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "command handler panicked".to_string()
    }
}

/// A single event handler; errors are logged by the caller, not reported
/// back over the wire (events have no response).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn call(&self, author: Uid, data: Value);
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Uid, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn call(&self, author: Uid, data: Value) {
        (self)(author, data).await
    }
}

/// Registry of named event handlers; every handler registered under a
/// name runs on dispatch (no uniqueness constraint, unlike `CommandGroup`).
#[derive(Default, Clone)]
pub struct EventGroup {
    handlers: Arc<std::sync::RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>>,
}

impl EventGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap()
            .entry(name.into())
            .or_default()
            .push(handler);
    }

    pub async fn dispatch(&self, name: &str, author: Uid, data: Value) {
        let handlers = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(name).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler.call(author, data.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_group_rejects_duplicate_names() {
        let group = CommandGroup::new();
        group
            .add("ping", Arc::new(|_: Uid, _: Value| async { Ok(Value::Null) }))
            .unwrap();
        let err = group
            .add("ping", Arc::new(|_: Uid, _: Value| async { Ok(Value::Null) }))
            .unwrap_err();
        assert!(matches!(err, FleetError::CommandAlreadyExists(_)));
    }

    #[tokio::test]
    async fn command_group_dispatch_not_found() {
        let group = CommandGroup::new();
        let outcome = group.dispatch("missing", 1, Value::Null).await;
        assert!(matches!(outcome, CommandOutcome::NotFound));
    }

    #[tokio::test]
    async fn command_group_dispatch_ok() {
        let group = CommandGroup::new();
        group
            .add("echo", Arc::new(|_: Uid, data: Value| async move { Ok(data) }))
            .unwrap();
        let outcome = group.dispatch("echo", 1, Value::from(5)).await;
        match outcome {
            CommandOutcome::Ok(v) => assert_eq!(v, Value::from(5)),
            _ => panic!("expected Ok"),
        }
    }

    #[tokio::test]
    async fn command_group_dispatch_reports_error_as_traceback() {
        let group = CommandGroup::new();
        group
            .add("fail", Arc::new(|_: Uid, _: Value| async {
                Err(FleetError::Protocol("boom".into()))
            }))
            .unwrap();
        let outcome = group.dispatch("fail", 1, Value::Null).await;
        match outcome {
            CommandOutcome::Traceback(msg) => assert!(msg.contains("boom")),
            _ => panic!("expected Traceback"),
        }
    }

    #[tokio::test]
    async fn command_group_dispatch_catches_panics() {
        let group = CommandGroup::new();
        group
            .add("panics", Arc::new(|_: Uid, _: Value| async { panic!("oh no") }))
            .unwrap();
        let outcome = group.dispatch("panics", 1, Value::Null).await;
        assert!(matches!(outcome, CommandOutcome::Traceback(_)));
    }

    #[tokio::test]
    async fn event_group_runs_every_registered_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let group = EventGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            group.add(
                "tick",
                Arc::new(move |_: Uid, _: Value| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }
        group.dispatch("tick", 1, Value::Null).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
