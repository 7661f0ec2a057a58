//! RPC method dispatch.
//!
//! Grounded in `original_source/src/dispatcher.hpp`: incoming `Call`s and
//! `Notification`s are looked up by name in a `HashMap`, with an optional
//! parent dispatcher consulted for bindings not registered locally (the
//! universe-shared dispatcher providing bindings common to every peer).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use ftl_protocol::{ErrorKind, ProtocolError};

/// A bound RPC method: takes the raw JSON args array, returns a JSON result
/// or an error string (mirroring the wire `Response.error` shape).
pub type Adapter = Box<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
    bindings: RwLock<HashMap<String, Adapter>>,
    parent: Option<Arc<Dispatcher>>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_parent(parent: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self { bindings: RwLock::new(HashMap::new()), parent: Some(parent) })
    }

    pub fn bind<F>(&self, name: impl Into<String>, adapter: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.bindings.write().insert(name.into(), Box::new(adapter));
    }

    pub fn unbind(&self, name: &str) {
        self.bindings.write().remove(name);
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
            || self.parent.as_ref().is_some_and(|p| p.is_bound(name))
    }

    /// Dispatch a call, consulting the parent dispatcher if this one has no
    /// local binding for `name`.
    pub fn dispatch(&self, name: &str, args: &[Value]) -> ftl_protocol::Result<Value> {
        if let Some(adapter) = self.bindings.read().get(name) {
            return adapter(args).map_err(|e| ProtocolError::new(ErrorKind::DispatchFailed, e));
        }
        if let Some(parent) = &self.parent {
            return parent.dispatch(name, args);
        }
        Err(ProtocolError::new(ErrorKind::DispatchFailed, format!("no binding for '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_to_local_binding() {
        let d = Dispatcher::new();
        d.bind("ping", |_args| Ok(Value::from("pong")));
        assert_eq!(d.dispatch("ping", &[]).unwrap(), Value::from("pong"));
    }

    #[test]
    fn falls_back_to_parent_binding() {
        let parent = Dispatcher::new();
        parent.bind("shared", |_args| Ok(Value::from(1)));
        let child = Dispatcher::with_parent(parent);
        assert_eq!(child.dispatch("shared", &[]).unwrap(), Value::from(1));
    }

    #[test]
    fn local_binding_shadows_parent() {
        let parent = Dispatcher::new();
        parent.bind("name", |_args| Ok(Value::from("parent")));
        let child = Dispatcher::with_parent(parent);
        child.bind("name", |_args| Ok(Value::from("child")));
        assert_eq!(child.dispatch("name", &[]).unwrap(), Value::from("child"));
    }

    #[test]
    fn unknown_method_is_dispatch_failed() {
        let d = Dispatcher::new();
        let err = d.dispatch("missing", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DispatchFailed);
    }

    #[test]
    fn adapter_error_is_reported_as_dispatch_failed() {
        let d = Dispatcher::new();
        d.bind("fails", |_args| Err("boom".to_string()));
        let err = d.dispatch("fails", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DispatchFailed);
        assert!(err.detail.contains("boom"));
    }
}
