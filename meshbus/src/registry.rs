//! Typed handler registration.
//!
//! Handlers are registered explicitly at wiring time against the concrete
//! command or event type; registration builds a monomorphic thunk that
//! erases the type at the dispatch boundary: decode MessagePack → invoke
//! the typed handler → encode the reply. The registry is frozen once the
//! bus starts.

use std::panic::{catch_unwind, AssertUnwindSafe};

use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{MeshError, Result};
use crate::topic::{short_type_name, topic_hash};

/// A command: request/reply across a scope.
///
/// The short type name is the wire identity of the command — every node of
/// the mesh must register the handler against the same type name.
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    /// Reply payload. Use `()` for void commands: zero-sized replies
    /// travel as zero-length payloads.
    type Reply: Serialize + DeserializeOwned + Default + Send + 'static;

    /// Wire name; the topic is its hash.
    #[must_use]
    fn name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// A fire-and-forget event distributed to every subscribed node.
pub trait Event: Serialize + DeserializeOwned + Send + 'static {
    /// Wire name; doubles as the publish topic.
    #[must_use]
    fn name() -> &'static str {
        short_type_name::<Self>()
    }
}

type CommandThunk = Box<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;
type EventThunk = Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// Topic → handler thunks. Built by the application wiring layer, then
/// immutable for the node's lifetime.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<u64, CommandThunk>,
    events: HashMap<String, Vec<EventThunk>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for command type `C`. Registering the same
    /// type again replaces the previous handler (last registration wins).
    pub fn on_command<C, F>(&mut self, handler: F)
    where
        C: Command,
        F: Fn(C) -> C::Reply + Send + Sync + 'static,
    {
        let thunk: CommandThunk = Box::new(move |payload| {
            let command: C = rmp_serde::from_slice(payload).map_err(MeshError::serialization)?;
            let reply = handler(command);
            if std::mem::size_of::<C::Reply>() == 0 {
                // Void reply: zero-length payload on the wire.
                Ok(Vec::new())
            } else {
                rmp_serde::to_vec(&reply).map_err(MeshError::serialization)
            }
        });
        self.commands.insert(topic_hash(C::name()), thunk);
    }

    /// Register a handler for event type `E`. Every registered handler for
    /// a type runs on each delivery, in registration order.
    pub fn on_event<E, F>(&mut self, handler: F)
    where
        E: Event,
        F: Fn(E) + Send + Sync + 'static,
    {
        let thunk: EventThunk = Box::new(move |payload| {
            let event: E = rmp_serde::from_slice(payload).map_err(MeshError::serialization)?;
            handler(event);
            Ok(())
        });
        self.events
            .entry(E::name().to_owned())
            .or_default()
            .push(thunk);
    }

    #[must_use]
    pub fn has_command(&self, topic: u64) -> bool {
        self.commands.contains_key(&topic)
    }

    /// Run the command handler for `topic`, containing every failure mode:
    /// a missing handler, a decode/encode error, and a panicking handler
    /// all produce an empty reply payload.
    #[must_use]
    pub(crate) fn handle_command(&self, topic: u64, payload: &[u8]) -> Vec<u8> {
        let Some(thunk) = self.commands.get(&topic) else {
            let err = MeshError::NoHandler(topic);
            debug!(%err, "request for unhandled topic gets an empty reply");
            return Vec::new();
        };

        match catch_unwind(AssertUnwindSafe(|| thunk(payload))) {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                error!(%err, "command handler failed");
                Vec::new()
            }
            Err(_) => {
                error!("command handler panicked");
                Vec::new()
            }
        }
    }

    /// Fan an event out to its handlers. Unknown topics and handler
    /// failures are logged and swallowed.
    pub(crate) fn handle_event(&self, topic: &str, payload: &[u8]) {
        let Some(thunks) = self.events.get(topic) else {
            debug!(topic, "no handler for event");
            return;
        };
        for thunk in thunks {
            match catch_unwind(AssertUnwindSafe(|| thunk(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(%err, topic, "event handler failed"),
                Err(_) => error!(topic, "event handler panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        msg: String,
    }

    impl Command for Ping {
        type Reply = String;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct UserCreated {
        name: String,
    }

    impl Command for UserCreated {
        type Reply = ();
    }

    impl Event for UserCreated {}

    #[test]
    fn command_thunk_roundtrips() {
        let mut registry = HandlerRegistry::new();
        registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));

        let payload = rmp_serde::to_vec(&Ping { msg: "hi".into() }).expect("encode");
        let reply = registry.handle_command(topic_hash("Ping"), &payload);
        let decoded: String = rmp_serde::from_slice(&reply).expect("decode");
        assert_eq!(decoded, "pong-hi");
    }

    #[test]
    fn void_reply_is_zero_length() {
        let mut registry = HandlerRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry.on_command::<UserCreated, _>(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let payload = rmp_serde::to_vec(&UserCreated { name: "A".into() }).expect("encode");
        let reply = registry.handle_command(topic_hash("UserCreated"), &payload);
        assert!(reply.is_empty());
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn missing_handler_yields_empty_reply() {
        let registry = HandlerRegistry::new();
        assert!(registry.handle_command(topic_hash("Nope"), &[]).is_empty());
    }

    #[test]
    fn panicking_handler_yields_empty_reply() {
        let mut registry = HandlerRegistry::new();
        registry.on_command::<Ping, _>(|_| panic!("boom"));

        let payload = rmp_serde::to_vec(&Ping { msg: "x".into() }).expect("encode");
        assert!(registry
            .handle_command(topic_hash("Ping"), &payload)
            .is_empty());
    }

    #[test]
    fn reregistration_replaces_the_thunk() {
        let mut registry = HandlerRegistry::new();
        registry.on_command::<Ping, _>(|_| "old".to_owned());
        registry.on_command::<Ping, _>(|_| "new".to_owned());

        let payload = rmp_serde::to_vec(&Ping { msg: "x".into() }).expect("encode");
        let reply = registry.handle_command(topic_hash("Ping"), &payload);
        let decoded: String = rmp_serde::from_slice(&reply).expect("decode");
        assert_eq!(decoded, "new");
    }

    #[test]
    fn events_fan_out_to_all_handlers() {
        let mut registry = HandlerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            registry.on_event::<UserCreated, _>(move |_| {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        let payload = rmp_serde::to_vec(&UserCreated { name: "A".into() }).expect("encode");
        registry.handle_event("UserCreated", &payload);
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn unknown_event_topic_is_swallowed() {
        HandlerRegistry::new().handle_event("Ghost", &[]);
    }
}
