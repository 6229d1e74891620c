//! Handlers and the registry mapping message types to them.
//!
//! A [`Handler`] serves one message type. It receives the resolved [`Request`] and a [`Context`] carrying the node
//! state and the freshly issued outgoing `msg_id`, and returns the reply payload, `None` for fire-and-forget
//! messages, or a [`NodeError`] which is sent back as an `error` reply.
//!
//! Handlers are stored type-erased as [`DynHandler`] in a [`HandlerRegistry`] keyed by the `type` tag. Registering
//! the same tag twice is a programming error reported at construction time, before any input is read.

use std::{
    borrow::{Borrow, Cow},
    collections::HashMap,
    fmt,
    hash::Hash,
};

use futures::{future::BoxFuture, Future, FutureExt};

use crate::{
    error::{NodeError, RegistryError},
    message::{Payload, Request},
    node::Context,
};

/// The outcome of handling a request.
///
/// `Ok(Some(_))` is sent as the reply, `Ok(None)` sends nothing, and `Err(_)` is sent as an `error` reply.
pub type HandlerResult = Result<Option<Payload>, NodeError>;

/// Serves requests of one message type.
///
/// # Example
///
/// ```
/// use murmur::message::{Inbound, Payload, Request};
/// use murmur::node::Context;
/// use murmur::registry::{Handler, HandlerResult};
/// use murmur::error::NodeError;
///
/// struct Echo;
///
/// impl Handler for Echo {
///     async fn handle(&self, req: Request, _ctx: Context) -> HandlerResult {
///         let Inbound::Known(Payload::Echo { echo }) = req.message else {
///             return Err(NodeError::malformed());
///         };
///         Ok(Some(Payload::EchoOk { echo }))
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Handles one request.
    fn handle(&self, req: Request, ctx: Context) -> impl Future<Output = HandlerResult> + Send;
}

/// An object safe [`Handler`].
///
/// This trait is implemented for all types which implement [`Handler`].
pub trait DynHandler: Send + Sync + 'static {
    /// Handles one request, boxing the returned future.
    fn handle_dyn(&self, req: Request, ctx: Context) -> BoxFuture<'_, HandlerResult>;
}

impl<H> DynHandler for H
where
    H: Handler,
{
    fn handle_dyn(&self, req: Request, ctx: Context) -> BoxFuture<'_, HandlerResult> {
        self.handle(req, ctx).boxed()
    }
}

/// A [`Handler`] backed by a closure. Created with [`handler_fn`].
#[derive(Clone, Copy)]
pub struct HandlerFn<F>(F);

/// Wraps a closure returning a future as a [`Handler`].
///
/// ```
/// use murmur::message::Payload;
/// use murmur::registry::handler_fn;
///
/// let ping = handler_fn(|_req, _ctx| async { Ok(Some(Payload::InitOk)) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send,
{
    HandlerFn(f)
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send,
{
    fn handle(&self, req: Request, ctx: Context) -> impl Future<Output = HandlerResult> + Send {
        (self.0)(req, ctx)
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

/// Handlers keyed by the message `type` they serve.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Cow<'static, str>, Box<dyn DynHandler>>,
}

impl HandlerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for messages of type `kind`.
    ///
    /// Fails with [`RegistryError::DuplicateHandler`] if a handler is already registered for `kind`, leaving the
    /// existing handler in place.
    pub fn register<H>(
        &mut self,
        kind: impl Into<Cow<'static, str>>,
        handler: H,
    ) -> Result<(), RegistryError>
    where
        H: Handler,
    {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateHandler(kind));
        }

        self.handlers.insert(kind, Box::new(handler));
        Ok(())
    }

    /// Gets the handler registered for `kind`.
    pub fn get<Q>(&self, kind: &Q) -> Option<&dyn DynHandler>
    where
        Q: Hash + Eq + ?Sized,
        Cow<'static, str>: Borrow<Q>,
    {
        self.handlers.get(kind).map(Box::as_ref)
    }

    /// Returns `true` if a handler is registered for `kind`.
    pub fn contains<Q>(&self, kind: &Q) -> bool
    where
        Q: Hash + Eq + ?Sized,
        Cow<'static, str>: Borrow<Q>,
    {
        self.handlers.contains_key(kind)
    }

    /// An iterator visiting all registered message types in arbitrary order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|kind| kind.as_ref())
    }

    /// The number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
