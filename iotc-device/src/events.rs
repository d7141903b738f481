use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Command;
use crate::pending::PendingMessage;
use crate::protocol::command::EnqueuedCommand;
use crate::protocol::twin::PropertyUpdate;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Receives desired property updates, returns whether the update was
/// accepted
pub type PropertiesHandler = Arc<dyn Fn(PropertyUpdate) -> BoxFuture<bool> + Send + Sync>;

/// Receives commands. A command not answered by the time it is dropped
/// gets the default response
pub type CommandHandler = Arc<dyn Fn(Command) -> BoxFuture<()> + Send + Sync>;

pub type EnqueuedCommandHandler = Arc<dyn Fn(EnqueuedCommand) -> BoxFuture<()> + Send + Sync>;

/// Receives messages once the transport confirmed their delivery
pub type MessageSentHandler = Arc<dyn Fn(PendingMessage) -> BoxFuture<()> + Send + Sync>;

pub type ConnectionStatusHandler = Arc<dyn Fn(ConnectionStatus) -> BoxFuture<()> + Send + Sync>;

/// Connection changes reported to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    /// Reconnecting gave up, the session stays disconnected
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Properties,
    Command,
    EnqueuedCommand,
    MessageSent,
    ConnectionStatus,
}

/// An application callback for one kind of event
#[derive(Clone)]
pub enum Handler {
    Properties(PropertiesHandler),
    Command(CommandHandler),
    EnqueuedCommand(EnqueuedCommandHandler),
    MessageSent(MessageSentHandler),
    ConnectionStatus(ConnectionStatusHandler),
}

impl Handler {
    /// Handle desired property updates
    ///
    /// ```
    /// use iotc_device::Handler;
    ///
    /// let handler = Handler::properties(|update| async move {
    ///     update.name != "readonly"
    /// });
    /// ```
    pub fn properties<F, Fut>(f: F) -> Self
    where
        F: Fn(PropertyUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::Properties(Arc::new(move |update| -> BoxFuture<bool> {
            Box::pin(f(update))
        }))
    }

    pub fn command<F, Fut>(f: F) -> Self
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Command(Arc::new(move |command| -> BoxFuture<()> {
            Box::pin(f(command))
        }))
    }

    pub fn enqueued_command<F, Fut>(f: F) -> Self
    where
        F: Fn(EnqueuedCommand) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::EnqueuedCommand(Arc::new(move |command| -> BoxFuture<()> {
            Box::pin(f(command))
        }))
    }

    pub fn message_sent<F, Fut>(f: F) -> Self
    where
        F: Fn(PendingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::MessageSent(Arc::new(move |message| -> BoxFuture<()> {
            Box::pin(f(message))
        }))
    }

    pub fn connection_status<F, Fut>(f: F) -> Self
    where
        F: Fn(ConnectionStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::ConnectionStatus(Arc::new(move |status| -> BoxFuture<()> {
            Box::pin(f(status))
        }))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Properties(_) => EventKind::Properties,
            Self::Command(_) => EventKind::Command,
            Self::EnqueuedCommand(_) => EventKind::EnqueuedCommand,
            Self::MessageSent(_) => EventKind::MessageSent,
            Self::ConnectionStatus(_) => EventKind::ConnectionStatus,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// Lock a std mutex, ignoring poisoning
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Slots {
    properties: Option<PropertiesHandler>,
    command: Option<CommandHandler>,
    enqueued_command: Option<EnqueuedCommandHandler>,
    message_sent: Option<MessageSentHandler>,
    connection_status: Option<ConnectionStatusHandler>,
}

/// One handler slot per event kind
pub(crate) struct HandlerTable {
    slots: Mutex<Slots>,
    changed: watch::Sender<u64>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            slots: Mutex::new(Slots::default()),
            changed,
        }
    }

    /// Install a handler, returning the one it replaces
    pub fn set(&self, handler: Handler) -> Option<Handler> {
        let previous = {
            let mut slots = lock(&self.slots);
            match handler {
                Handler::Properties(h) => slots.properties.replace(h).map(Handler::Properties),
                Handler::Command(h) => slots.command.replace(h).map(Handler::Command),
                Handler::EnqueuedCommand(h) => slots
                    .enqueued_command
                    .replace(h)
                    .map(Handler::EnqueuedCommand),
                Handler::MessageSent(h) => slots.message_sent.replace(h).map(Handler::MessageSent),
                Handler::ConnectionStatus(h) => slots
                    .connection_status
                    .replace(h)
                    .map(Handler::ConnectionStatus),
            }
        };
        self.changed.send_modify(|generation| *generation += 1);
        previous
    }

    pub fn properties(&self) -> Option<PropertiesHandler> {
        lock(&self.slots).properties.clone()
    }

    pub fn command(&self) -> Option<CommandHandler> {
        lock(&self.slots).command.clone()
    }

    pub fn enqueued_command(&self) -> Option<EnqueuedCommandHandler> {
        lock(&self.slots).enqueued_command.clone()
    }

    pub fn message_sent(&self) -> Option<MessageSentHandler> {
        lock(&self.slots).message_sent.clone()
    }

    pub fn connection_status(&self) -> Option<ConnectionStatusHandler> {
        lock(&self.slots).connection_status.clone()
    }

    /// Wait until `pick` finds a handler. Returns `None` if cancelled first
    pub async fn wait_for<T>(
        &self,
        pick: impl Fn(&Self) -> Option<T>,
        cancel: &CancellationToken,
    ) -> Option<T> {
        let mut changed = self.changed.subscribe();
        loop {
            if let Some(handler) = pick(self) {
                return Some(handler);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                // the sender lives as long as the table
                _ = changed.changed() => {}
            }
        }
    }
}
