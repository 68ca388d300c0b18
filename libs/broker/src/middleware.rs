//! Middleware chain
//!
//! A middleware transforms an action handler into a wrapped handler. The
//! chain is applied when a service registers: middlewares run in
//! registration order, so the first registered one ends up innermost and
//! the last registered one outermost.
//!
//! Wrapping happens once, at registration. Middlewares added afterwards
//! apply only to services registered later; existing actions are never
//! retroactively re-wrapped. That is a documented contract, not an
//! accident.

use crate::service::ActionHandler;
use flock_types::ActionInfo;
use std::sync::Arc;

/// A handler decorator: receives the inner handler and the action it
/// guards, returns the wrapped handler.
pub type Middleware = Arc<dyn Fn(ActionHandler, &ActionInfo) -> ActionHandler + Send + Sync>;

/// Ordered collection of middlewares.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stack: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Middleware) {
        self.stack.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Compose the chain around `handler`:
    /// `wrap_n(wrap_{n-1}(… wrap_1(handler)))`.
    pub fn wrap(&self, handler: ActionHandler, action: &ActionInfo) -> ActionHandler {
        let mut wrapped = handler;
        for middleware in &self.stack {
            wrapped = middleware(wrapped, action);
        }
        wrapped
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.stack.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use serde_json::{json, Value};

    fn tagging_middleware(tag: &'static str) -> Middleware {
        Arc::new(move |inner: ActionHandler, _action: &ActionInfo| {
            let inner = inner.clone();
            Arc::new(move |ctx: Context| {
                let inner = inner.clone();
                Box::pin(async move {
                    let result = inner(ctx).await?;
                    let mut order = result.as_array().cloned().unwrap_or_default();
                    order.push(json!(tag));
                    Ok(Value::Array(order))
                })
            })
        })
    }

    #[tokio::test]
    async fn test_last_registered_is_outermost() {
        let mut chain = MiddlewareChain::new();
        chain.add(tagging_middleware("first"));
        chain.add(tagging_middleware("second"));
        chain.add(tagging_middleware("third"));

        let base: ActionHandler = Arc::new(|_ctx| Box::pin(async { Ok(json!(["base"])) }));
        let wrapped = chain.wrap(base, &ActionInfo::new("a.b"));

        let ctx = Context::new_root("a.b", json!({}), false);
        let result = wrapped(ctx).await.unwrap();

        // Inner handlers append first, so the outermost middleware's tag
        // comes last: base, then first..third inside-out.
        assert_eq!(result, json!(["base", "first", "second", "third"]));
    }

    #[tokio::test]
    async fn test_empty_chain_is_identity() {
        let chain = MiddlewareChain::new();
        let base: ActionHandler = Arc::new(|_ctx| Box::pin(async { Ok(json!(42)) }));
        let wrapped = chain.wrap(base, &ActionInfo::new("a.b"));

        let ctx = Context::new_root("a.b", json!({}), false);
        assert_eq!(wrapped(ctx).await.unwrap(), json!(42));
    }
}
