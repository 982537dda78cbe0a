//! Handler registry for dispatching requests by method name.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;

use super::RequestContext;
use crate::codec::Codec;
use crate::error::Result;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with its raw payload.
    fn call(&self, payload: Bytes, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes the payload with `C` before calling the handler.
pub struct TypedHandler<C, F, Fut> {
    handler: F,
    _phantom: PhantomData<fn(C) -> Fut>,
}

impl<C, F, Fut> TypedHandler<C, F, Fut>
where
    C: Codec,
    F: Fn(C::Item, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<C, F, Fut> Handler for TypedHandler<C, F, Fut>
where
    C: Codec + 'static,
    F: Fn(C::Item, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: Bytes, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let item = match C::decode(payload) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        Box::pin((self.handler)(item, ctx))
    }
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler whose request payload is decoded with `C`.
    ///
    /// A second registration for the same name replaces the first.
    pub fn register<C, F, Fut>(&mut self, name: &str, handler: F)
    where
        C: Codec + 'static,
        F: Fn(C::Item, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods
            .insert(name.to_string(), Box::new(TypedHandler::<C, F, Fut>::new(handler)));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Handler> {
        self.methods.get(name).map(|h| h.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
