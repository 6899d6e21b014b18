//! Command-dispatch core shared by the client and the server.
//!
//! Stores a single command -> handler mapping, runs handlers inline or on a
//! spawned task, and implements the blocking [`recv`](Dispatcher::recv)
//! primitive via a waiter table that the dispatch loop fulfills as frames
//! arrive.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A boxed, owned future, the shape every handler and the dispatcher itself
/// deal in since handlers may run inline or on a spawned task.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error returned by a user handler. Handlers log through this rather than
/// panicking so one bad handler cannot take down the dispatch loop.
#[derive(Debug)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

type HandlerFn<Ctx> = Arc<dyn Fn(Ctx, Vec<u8>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// A single registered user-command handler.
#[derive(Clone)]
pub struct HandlerEntry<Ctx> {
    pub display_name: String,
    pub threaded: bool,
    handler: HandlerFn<Ctx>,
}

/// Failure registering a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A handler is already registered under this command name.
    AlreadyRegistered(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::AlreadyRegistered(cmd) => {
                write!(f, "a handler is already registered for command {cmd:?}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// What happened when an inbound user command was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A registered handler ran.
    Handled,
    /// A blocking [`recv`](Dispatcher::recv) waiter was fulfilled.
    DeliveredToWaiter,
    /// Nothing matched; caller should emit a `NoHandler` warning.
    Unhandled,
}

struct PendingTable {
    by_command: HashMap<String, VecDeque<oneshot::Sender<Vec<u8>>>>,
    catch_all: VecDeque<oneshot::Sender<Vec<u8>>>,
}

impl PendingTable {
    fn new() -> Self {
        PendingTable {
            by_command: HashMap::new(),
            catch_all: VecDeque::new(),
        }
    }
}

/// Command dispatch table plus the blocking-`recv` waiter machinery.
///
/// Generic over the `Ctx` type passed to every handler alongside the
/// message bytes: the server instantiates this with a per-client handle,
/// the client instantiates it with `()`.
pub struct Dispatcher<Ctx> {
    handlers: Mutex<HashMap<String, HandlerEntry<Ctx>>>,
    pending: Mutex<PendingTable>,
}

impl<Ctx: Clone + Send + Sync + 'static> Dispatcher<Ctx> {
    pub fn new() -> Self {
        Dispatcher {
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingTable::new()),
        }
    }

    /// Register a handler for `command`. Replaces any previous registration
    /// unless `keep_existing` is set, in which case an existing registration
    /// is reported as an error.
    pub fn register<F, Fut>(
        &self,
        command: impl Into<String>,
        display_name: impl Into<String>,
        threaded: bool,
        keep_existing: bool,
        handler: F,
    ) -> Result<(), DispatchError>
    where
        F: Fn(Ctx, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let command = command.into();
        let mut handlers = self.handlers.lock();
        if keep_existing && handlers.contains_key(&command) {
            return Err(DispatchError::AlreadyRegistered(command));
        }
        handlers.insert(
            command,
            HandlerEntry {
                display_name: display_name.into(),
                threaded,
                handler: Arc::new(move |ctx, msg| Box::pin(handler(ctx, msg))),
            },
        );
        Ok(())
    }

    pub fn unregister(&self, command: &str) -> bool {
        self.handlers.lock().remove(command).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_registered(&self, command: &str) -> bool {
        self.handlers.lock().contains_key(command)
    }

    /// Route one inbound user command. Runs the matching handler (inline or
    /// spawned, per its registration), or fulfills a waiting [`recv`] call,
    /// or reports [`DispatchOutcome::Unhandled`]. `ctx` is handed to the
    /// handler alongside the raw message bytes.
    pub async fn dispatch(&self, ctx: Ctx, command: &str, message: Vec<u8>) -> DispatchOutcome {
        let entry = self.handlers.lock().get(command).cloned();
        if let Some(entry) = entry {
            self.run_handler(entry, ctx, message).await;
            return DispatchOutcome::Handled;
        }

        if self.fulfil_waiter(command, message) {
            return DispatchOutcome::DeliveredToWaiter;
        }

        DispatchOutcome::Unhandled
    }

    /// Invoke a handler. A `threaded` handler is spawned onto its own task
    /// so its side effects are not ordered with respect to subsequent
    /// frames on this connection; a non-threaded handler is awaited
    /// in-line, which is what gives a single connection's handler
    /// invocations their wire-arrival order.
    async fn run_handler(&self, entry: HandlerEntry<Ctx>, ctx: Ctx, message: Vec<u8>) {
        let display_name = entry.display_name.clone();
        let fut = (entry.handler)(ctx, message);
        if entry.threaded {
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    tracing::warn!(handler = %display_name, error = %e, "threaded handler returned an error");
                }
            });
        } else if let Err(e) = fut.await {
            tracing::warn!(handler = %display_name, error = %e, "handler returned an error");
        }
    }

    fn fulfil_waiter(&self, command: &str, message: Vec<u8>) -> bool {
        let mut pending = self.pending.lock();
        if let Some(queue) = pending.by_command.get_mut(command) {
            while let Some(sender) = queue.pop_front() {
                match sender.send(message.clone()) {
                    Ok(()) => return true,
                    Err(_) => continue, // caller gave up; try the next waiter
                }
            }
        }
        while let Some(sender) = pending.catch_all.pop_front() {
            if sender.send(message.clone()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Install a waiter and block (suspend) until a matching command
    /// arrives. `command = None` installs a catch-all waiter; the oldest
    /// catch-all waiter is always fulfilled first (FIFO).
    pub async fn recv(&self, command: Option<&str>) -> Vec<u8> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            match command {
                Some(cmd) => pending
                    .by_command
                    .entry(cmd.to_string())
                    .or_default()
                    .push_back(tx),
                None => pending.catch_all.push_back(tx),
            }
        }
        rx.await.unwrap_or_default()
    }
}

impl<Ctx: Clone + Send + Sync + 'static> Default for Dispatcher<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_is_fulfilled_by_dispatch() {
        let dispatcher: Arc<Dispatcher<()>> = Arc::new(Dispatcher::new());
        let d = dispatcher.clone();
        let waiter = tokio::spawn(async move { d.recv(Some("pong")).await });

        // give the waiter a chance to register
        tokio::task::yield_now().await;
        let outcome = dispatcher.dispatch((), "pong", b"ok".to_vec()).await;
        assert_eq!(outcome, DispatchOutcome::DeliveredToWaiter);
        assert_eq!(waiter.await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn catch_all_waiters_are_fifo() {
        let dispatcher: Arc<Dispatcher<()>> = Arc::new(Dispatcher::new());
        let d1 = dispatcher.clone();
        let d2 = dispatcher.clone();
        let first = tokio::spawn(async move { d1.recv(None).await });
        tokio::task::yield_now().await;
        let second = tokio::spawn(async move { d2.recv(None).await });
        tokio::task::yield_now().await;

        dispatcher.dispatch((), "anything", b"one".to_vec()).await;
        dispatcher.dispatch((), "anything", b"two".to_vec()).await;

        assert_eq!(first.await.unwrap(), b"one");
        assert_eq!(second.await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn unhandled_when_no_handler_or_waiter() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        let outcome = dispatcher.dispatch((), "nobody-home", b"x".to_vec()).await;
        assert_eq!(outcome, DispatchOutcome::Unhandled);
    }

    #[test]
    fn at_most_one_handler_per_command() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        dispatcher
            .register("ping", "ping", false, false, |_ctx: (), _msg| async {
                Ok::<(), HandlerError>(())
            })
            .unwrap();
        assert_eq!(dispatcher.handler_count(), 1);
        dispatcher
            .register("ping", "ping2", false, false, |_ctx: (), _msg| async {
                Ok::<(), HandlerError>(())
            })
            .unwrap();
        assert_eq!(dispatcher.handler_count(), 1);
    }
}
