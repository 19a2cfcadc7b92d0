//! Events and completion signals.

use crate::kind::Kind;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::IntoFuture;
use tokio::sync::watch;

/// A trigger that can cause state transitions.
///
/// `name` is matched against transition trigger patterns (glob `*`). `id` is
/// minted on first dispatch when zero. `data` is an opaque payload delivered
/// to guards, effects, and entry/exit behaviors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub kind: Kind,
    pub name: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub data: Value,
}

/// Name given to the error events synthesized from recovered panics and
/// cancellation timeouts, so models can route failures through transitions.
pub const ERROR_EVENT_NAME: &str = "error";

impl Event {
    /// Creates a normal event with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            kind: Kind::EVENT,
            name: name.into(),
            id: 0,
            data: Value::Null,
        }
    }

    /// Creates a completion event, which preempts normal events in the queue.
    pub fn completion(name: impl Into<String>) -> Self {
        Self {
            kind: Kind::COMPLETION_EVENT,
            name: name.into(),
            id: 0,
            data: Value::Null,
        }
    }

    /// Creates an error event carrying a description of the failure.
    pub fn error(description: impl Into<String>) -> Self {
        Self {
            kind: Kind::ERROR_EVENT,
            name: ERROR_EVENT_NAME.to_string(),
            id: 0,
            data: Value::String(description.into()),
        }
    }

    /// Attaches a payload.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    /// Deserializes the payload into a concrete type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// A completion signal returned by dispatch operations.
///
/// Awaiting it resolves once every targeted instance has drained its queue
/// past the dispatched event (the next idle signal of the processing mutex).
/// Dispatches to stopped instances resolve immediately.
#[derive(Debug)]
pub struct Done(DoneKind);

#[derive(Debug)]
enum DoneKind {
    Ready,
    Idle { rx: watch::Receiver<u64>, target: u64 },
    All(Vec<Done>),
}

impl Done {
    /// An already-completed signal.
    pub fn ready() -> Self {
        Done(DoneKind::Ready)
    }

    pub(crate) fn until(rx: watch::Receiver<u64>, target: u64) -> Self {
        Done(DoneKind::Idle { rx, target })
    }

    /// Combines signals; the result completes when all of them do.
    pub fn all(signals: Vec<Done>) -> Self {
        Done(DoneKind::All(signals))
    }

    /// Waits for the signal.
    pub async fn wait(self) {
        match self.0 {
            DoneKind::Ready => {}
            DoneKind::Idle { mut rx, target } => {
                // An error means the instance dropped its idle channel, which
                // only happens when it is fully torn down; either way the
                // event will never be observed again.
                let _ = rx.wait_for(|generation| *generation >= target).await;
            }
            DoneKind::All(signals) => {
                for signal in signals {
                    Box::pin(signal.wait()).await;
                }
            }
        }
    }
}

impl IntoFuture for Done {
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}
