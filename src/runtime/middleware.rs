//! Middleware around the core execution step of each dispatcher.
//!
//! A dispatcher stores its inputs in a [`DispatchMiddlewareContext`] and runs its own
//! execution as the innermost handler. A middleware that stores the result property itself
//! and returns without calling `next` replaces that execution.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::DispatchError;

/// Type-keyed property bag carried through the middleware chain.
#[derive(Default)]
pub struct DispatchMiddlewareContext {
    properties: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl DispatchMiddlewareContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property<T: Any + Send + Sync>(&mut self, value: T) {
        self.properties.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get_property<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.properties.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref())
    }

    pub fn has_property<T: Any + Send + Sync>(&self) -> bool {
        self.properties.contains_key(&TypeId::of::<T>())
    }

    pub fn take_property<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.properties
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|v| *v)
    }
}

type Terminal<'a> = &'a (dyn Fn(DispatchMiddlewareContext) -> BoxFuture<'static, Result<DispatchMiddlewareContext, DispatchError>>
         + Send
         + Sync);

/// The rest of the chain, handed to each middleware.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn DispatchMiddleware>],
    terminal: Terminal<'a>,
}

impl Next<'_> {
    pub async fn run(self, ctx: DispatchMiddlewareContext) -> Result<DispatchMiddlewareContext, DispatchError> {
        match self.middleware.split_first() {
            Some((first, rest)) => {
                first
                    .handle(
                        ctx,
                        Next {
                            middleware: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

#[async_trait]
pub trait DispatchMiddleware: Send + Sync {
    async fn handle(
        &self,
        ctx: DispatchMiddlewareContext,
        next: Next<'_>,
    ) -> Result<DispatchMiddlewareContext, DispatchError>;
}

#[derive(Clone, Default)]
pub struct DispatchMiddlewarePipeline {
    middleware: Vec<Arc<dyn DispatchMiddleware>>,
}

impl DispatchMiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware; earlier ones run outermost.
    pub fn add(&mut self, middleware: impl DispatchMiddleware + 'static) {
        self.middleware.push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub async fn run<F, Fut>(&self, ctx: DispatchMiddlewareContext, handler: F) -> Result<DispatchMiddlewareContext, DispatchError>
    where
        F: Fn(DispatchMiddlewareContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<DispatchMiddlewareContext, DispatchError>> + Send + 'static,
    {
        let terminal = move |ctx: DispatchMiddlewareContext| handler(ctx).boxed();
        Next {
            middleware: &self.middleware,
            terminal: &terminal,
        }
        .run(ctx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    struct Output(&'static str);

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl DispatchMiddleware for Record {
        async fn handle(
            &self,
            ctx: DispatchMiddlewareContext,
            next: Next<'_>,
        ) -> Result<DispatchMiddlewareContext, DispatchError> {
            self.log.lock().unwrap().push(self.name);
            next.run(ctx).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl DispatchMiddleware for ShortCircuit {
        async fn handle(
            &self,
            mut ctx: DispatchMiddlewareContext,
            _next: Next<'_>,
        ) -> Result<DispatchMiddlewareContext, DispatchError> {
            ctx.set_property(Output("substituted"));
            Ok(ctx)
        }
    }

    #[tokio::test]
    async fn middleware_runs_in_order_around_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = DispatchMiddlewarePipeline::new();
        pipeline.add(Record { name: "outer", log: log.clone() });
        pipeline.add(Record { name: "inner", log: log.clone() });

        let handler_log = log.clone();
        let ctx = pipeline
            .run(DispatchMiddlewareContext::new(), move |mut ctx| {
                handler_log.lock().unwrap().push("handler");
                ctx.set_property(Output("executed"));
                async move { Ok(ctx) }
            })
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "handler"]);
        assert_eq!(ctx.get_property::<Output>(), Some(&Output("executed")));
    }

    #[tokio::test]
    async fn middleware_can_substitute_execution() {
        let mut pipeline = DispatchMiddlewarePipeline::new();
        pipeline.add(ShortCircuit);
        let mut ctx = pipeline
            .run(DispatchMiddlewareContext::new(), |mut ctx| {
                ctx.set_property(Output("executed"));
                async move { Ok(ctx) }
            })
            .await
            .unwrap();
        assert_eq!(ctx.take_property::<Output>(), Some(Output("substituted")));
        assert!(!ctx.has_property::<Output>());
    }
}
