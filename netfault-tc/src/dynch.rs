//! A channel of dynamically typed requests, each carrying a task that borrows the receiver's
//! context and produces an arbitrary response type.
//!
//! The receiving end of this channel is a thread that entered a foreign network namespace (see
//! [`crate::namespace`]). Such a thread cannot be cloned per request type: every extra actor
//! would cost an OS thread, a `setns` call and an asynchronous runtime. Instead, a single actor
//! owns the context (an rtnetlink connection bound to the namespace) and runs whatever task it is
//! handed, while the sender keeps a typed handle to the response.

use std::{any::Any, future::Future, marker::PhantomData, pin::Pin};

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument as _;

use crate::error::{Error, Result};

type AnySendStatic = dyn Any + Send + 'static;

/// A [`Future`] trait object which can borrow from the actor context for `'a`.
pub type DynFuture<'a, T = Box<AnySendStatic>> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed function that, given a mutable reference to `Ctx`, produces a future.
pub type DynTask<Ctx, T = Box<AnySendStatic>> =
    Box<dyn for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static>;

/// A type-erased request, as received by the actor.
pub struct DynRequest<Ctx> {
    task: DynTask<Ctx>,
    tx: oneshot::Sender<Box<AnySendStatic>>,
    /// The span active when the request was submitted, so work done by the actor shows up
    /// under the caller's span.
    span: tracing::Span,
}

impl<Ctx> std::fmt::Debug for DynRequest<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynRequest").field("span", &self.span).finish_non_exhaustive()
    }
}

impl<Ctx> DynRequest<Ctx> {
    /// Run the task against the context and send back its response. A caller that stopped
    /// waiting is not an error for the actor.
    pub async fn run(self, ctx: &mut Ctx) {
        let Self { task, tx, span } = self;
        let value = task(ctx).instrument(span).await;
        if tx.send(value).is_err() {
            tracing::debug!("request response dropped, caller went away");
        }
    }
}

/// Handle to the response of a submitted request.
#[derive(Debug)]
pub struct DynResponse<T: 'static> {
    rx: oneshot::Receiver<Box<AnySendStatic>>,
    _marker: PhantomData<T>,
}

impl<T: 'static> DynResponse<T> {
    /// Wait for the actor to process the request.
    pub async fn receive(self) -> Result<T> {
        let value = self.rx.await.map_err(|_| Error::NamespaceStopped)?;
        // The task was type-erased from a `T` in `submit`.
        Ok(*value.downcast::<T>().expect("response type matches request"))
    }
}

/// The sending half of the channel.
#[derive(Debug)]
pub struct DynRequestSender<Ctx> {
    tx: mpsc::Sender<DynRequest<Ctx>>,
}

impl<Ctx> Clone for DynRequestSender<Ctx> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<Ctx> DynRequestSender<Ctx> {
    /// Submit a task to the actor.
    ///
    /// ```
    /// use netfault_tc::dynch;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> netfault_tc::Result<()> {
    /// let (tx, mut rx) = dynch::channel::<usize>(8);
    ///
    /// tokio::spawn(async move {
    ///     let mut counter = 0;
    ///     while let Some(request) = rx.recv().await {
    ///         request.run(&mut counter).await;
    ///     }
    /// });
    ///
    /// let value = tx.call(|counter| Box::pin(async move {
    ///     *counter += 1;
    ///     *counter
    /// })).await?;
    ///
    /// assert_eq!(value, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit<T, F>(&self, f: F) -> Result<DynResponse<T>>
    where
        T: Any + Send + 'static,
        F: for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static,
    {
        let task: DynTask<Ctx> = Box::new(move |ctx: &mut Ctx| {
            let fut = f(ctx);
            Box::pin(async move { Box::new(fut.await) as Box<AnySendStatic> })
        });

        let (tx, rx) = oneshot::channel();
        let request = DynRequest { task, tx, span: tracing::Span::current() };
        self.tx.send(request).await.map_err(|_| Error::NamespaceStopped)?;

        Ok(DynResponse { rx, _marker: PhantomData })
    }

    /// Submit a task and wait for its response.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Any + Send + 'static,
        F: for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static,
    {
        self.submit(f).await?.receive().await
    }

    /// Whether the actor has stopped receiving requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a bounded request channel.
pub fn channel<Ctx>(buffer: usize) -> (DynRequestSender<Ctx>, mpsc::Receiver<DynRequest<Ctx>>) {
    let (tx, rx) = mpsc::channel(buffer);
    (DynRequestSender { tx }, rx)
}
