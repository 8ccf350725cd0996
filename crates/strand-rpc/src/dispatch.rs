//! Inbound request dispatch: the handler registry.
//!
//! Handlers are double-indexed by the canonical task-code name and by an
//! optional alias, plus a numeric-code index for the hot path where the
//! local code is already resolved. Dispatch takes the read side of the
//! registry locks; registration and unregistration take the write side.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::engine::RpcEngine;
use crate::message::Message;
use crate::task::TaskCode;

/// Boxed future returned by request handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered RPC request handler.
///
/// The handler receives the engine (to reply or forward through) and the
/// request message, and runs on a worker of the engine's pool.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one inbound request.
    fn handle(&self, engine: Arc<RpcEngine>, request: Message) -> HandlerFuture;
}

impl<F> RequestHandler for F
where
    F: Fn(Arc<RpcEngine>, Message) -> HandlerFuture + Send + Sync + 'static,
{
    fn handle(&self, engine: Arc<RpcEngine>, request: Message) -> HandlerFuture {
        self(engine, request)
    }
}

struct HandlerEntry {
    code: TaskCode,
    alias: String,
    handler: Arc<dyn RequestHandler>,
}

/// Registry of inbound request handlers.
pub struct ServerDispatcher {
    by_name: RwLock<HashMap<String, Arc<HandlerEntry>>>,
    by_code: RwLock<HashMap<u32, Arc<HandlerEntry>>>,
}

impl ServerDispatcher {
    pub(crate) fn new() -> Self {
        ServerDispatcher {
            by_name: RwLock::new(HashMap::new()),
            by_code: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under `code` and, when non-empty, under `alias`
    /// too. A conflict on either name is a caller bug; registration fails
    /// and nothing is modified.
    pub fn register(
        &self,
        code: TaskCode,
        alias: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> bool {
        let name = code.name();
        let mut by_name = self.by_name.write().unwrap();
        if by_name.contains_key(name) || (!alias.is_empty() && by_name.contains_key(alias)) {
            warn!(code = name, alias, "rpc handler registration conflict");
            return false;
        }
        let entry = Arc::new(HandlerEntry {
            code,
            alias: alias.to_string(),
            handler,
        });
        by_name.insert(name.to_string(), entry.clone());
        if !alias.is_empty() && alias != name {
            by_name.insert(alias.to_string(), entry.clone());
        }
        self.by_code.write().unwrap().insert(code.as_u32(), entry);
        true
    }

    /// Remove the handler for `code` and its alias. Returns `false` when
    /// no handler was registered.
    pub fn unregister(&self, code: TaskCode) -> bool {
        let mut by_name = self.by_name.write().unwrap();
        let Some(entry) = by_name.remove(code.name()) else {
            return false;
        };
        if !entry.alias.is_empty() {
            by_name.remove(&entry.alias);
        }
        self.by_code.write().unwrap().remove(&code.as_u32());
        true
    }

    /// Number of registered codes.
    pub fn handler_count(&self) -> usize {
        self.by_code.read().unwrap().len()
    }

    /// Resolve the handler for an inbound request, preferring the numeric
    /// code when the message already carries a valid one and populating it
    /// from the name index otherwise. Fires the task-creation hook on a
    /// match; returns `None` when no handler exists so the caller can
    /// synthesize a handler-not-found response.
    pub(crate) fn on_request(&self, msg: &mut Message) -> Option<Arc<dyn RequestHandler>> {
        let entry = if !msg.local_code.is_invalid() {
            self.by_code
                .read()
                .unwrap()
                .get(&msg.local_code.as_u32())
                .cloned()
        } else {
            let entry = self
                .by_name
                .read()
                .unwrap()
                .get(&msg.header.rpc_name)
                .cloned();
            if let Some(entry) = &entry {
                msg.local_code = entry.code;
            }
            entry
        };
        let entry = entry?;
        entry.code.spec().notify_task_create(msg);
        Some(entry.handler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Arc<dyn RequestHandler> {
        Arc::new(move |_engine: Arc<RpcEngine>, _request: Message| -> HandlerFuture {
            Box::pin(async {})
        })
    }

    #[test]
    fn test_register_and_resolve_by_code() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_DISPATCH_TEST_BY_CODE");
        assert!(dispatcher.register(code, "by_code_alias", noop_handler()));

        let mut msg = Message::request(code);
        assert!(dispatcher.on_request(&mut msg).is_some());
    }

    #[test]
    fn test_resolve_by_name_populates_local_code() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_DISPATCH_TEST_BY_NAME");
        assert!(dispatcher.register(code, "", noop_handler()));

        let mut msg = Message::request(code);
        msg.local_code = TaskCode::INVALID;
        assert!(dispatcher.on_request(&mut msg).is_some());
        assert_eq!(msg.local_code, code);
    }

    #[test]
    fn test_resolve_by_alias() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_DISPATCH_TEST_ALIASED");
        assert!(dispatcher.register(code, "legacy.dispatch.name", noop_handler()));

        let mut msg = Message::request(code);
        msg.local_code = TaskCode::INVALID;
        msg.header.rpc_name = "legacy.dispatch.name".to_string();
        assert!(dispatcher.on_request(&mut msg).is_some());
        assert_eq!(msg.local_code, code);
    }

    #[test]
    fn test_conflicting_registration_fails() {
        let dispatcher = ServerDispatcher::new();
        let a = TaskCode::register("RPC_DISPATCH_TEST_CONFLICT_A");
        let b = TaskCode::register("RPC_DISPATCH_TEST_CONFLICT_B");
        assert!(dispatcher.register(a, "shared_alias", noop_handler()));
        assert!(!dispatcher.register(b, "shared_alias", noop_handler()));
        assert!(!dispatcher.register(a, "another_alias", noop_handler()));
        assert_eq!(dispatcher.handler_count(), 1);
    }

    #[test]
    fn test_unregister_severs_both_names() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_DISPATCH_TEST_UNREGISTER");
        assert!(dispatcher.register(code, "unregister_alias", noop_handler()));
        assert!(dispatcher.unregister(code));
        assert!(!dispatcher.unregister(code));

        let mut by_code = Message::request(code);
        assert!(dispatcher.on_request(&mut by_code).is_none());

        let mut by_alias = Message::request(code);
        by_alias.local_code = TaskCode::INVALID;
        by_alias.header.rpc_name = "unregister_alias".to_string();
        assert!(dispatcher.on_request(&mut by_alias).is_none());
    }

    #[test]
    fn test_unknown_request_yields_none() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_DISPATCH_TEST_UNKNOWN");
        let mut msg = Message::request(code);
        msg.local_code = TaskCode::INVALID;
        msg.header.rpc_name = "RPC_DISPATCH_TEST_NEVER_SEEN".to_string();
        assert!(dispatcher.on_request(&mut msg).is_none());
    }
}
