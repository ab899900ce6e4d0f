//! Boolean conditions evaluated by gates and loops.
//!
//! A [`Predicate`] is either a plain closure or an async one. Both receive a
//! snapshot of the result context and cannot reach the task graph.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

type SyncFn<C> = dyn Fn(&C) -> bool + Send + Sync;
type AsyncFn<C> = dyn Fn(C) -> BoxFuture<'static, bool> + Send + Sync;

/// A sync or async condition over a context of type `C`.
pub enum Predicate<C> {
    Sync(Arc<SyncFn<C>>),
    Async(Arc<AsyncFn<C>>),
}

impl<C> Predicate<C>
where
    C: Clone + Send + 'static,
{
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        Predicate::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Predicate::Async(Arc::new(move |ctx| f(ctx).boxed()))
    }

    /// Predicate that always holds.
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    pub async fn evaluate(&self, ctx: &C) -> bool {
        match self {
            Predicate::Sync(f) => f(ctx),
            Predicate::Async(f) => f(ctx.clone()).await,
        }
    }
}

impl<C> Clone for Predicate<C> {
    fn clone(&self) -> Self {
        match self {
            Predicate::Sync(f) => Predicate::Sync(Arc::clone(f)),
            Predicate::Async(f) => Predicate::Async(Arc::clone(f)),
        }
    }
}

impl<C> std::fmt::Debug for Predicate<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Sync(_) => write!(f, "Predicate::Sync"),
            Predicate::Async(_) => write!(f, "Predicate::Async"),
        }
    }
}
