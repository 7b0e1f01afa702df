//! Explicit payload-type → handler tables.
//!
//! Handlers are registered up front, keyed by [`EventPayload::PAYLOAD_TYPE`].
//! Dispatch decodes the payload and calls the matching handler; payload types
//! without a handler are skipped.

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use crate::event::EventPayload;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("a handler for payload type '{0}' is already registered")]
    Duplicate(&'static str),

    #[error("failed to decode payload of type '{payload_type}': {source}")]
    Decode {
        payload_type: String,
        #[source]
        source: serde_json::Error,
    },
}

type BoxedHandler<T> = Box<dyn Fn(&mut T, &[u8]) -> Result<(), HandlerError> + Send + Sync>;

/// Handlers that apply decoded payloads to a target of type `T`.
pub struct HandlerRegistry<T> {
    handlers: HashMap<&'static str, BoxedHandler<T>>,
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<T> core::fmt::Debug for HandlerRegistry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("payload_types", &types)
            .finish()
    }
}

impl<T> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for payload type `E`.
    pub fn register<E, H>(&mut self, handler: H) -> Result<&mut Self, HandlerError>
    where
        E: EventPayload,
        H: Fn(&mut T, E) + Send + Sync + 'static,
    {
        if self.handlers.contains_key(E::PAYLOAD_TYPE) {
            return Err(HandlerError::Duplicate(E::PAYLOAD_TYPE));
        }

        self.handlers.insert(
            E::PAYLOAD_TYPE,
            Box::new(move |target, payload| {
                let event = E::decode(payload).map_err(|source| HandlerError::Decode {
                    payload_type: E::PAYLOAD_TYPE.to_string(),
                    source,
                })?;
                handler(target, event);
                Ok(())
            }),
        );
        Ok(self)
    }

    pub fn can_dispatch(&self, payload_type: &str) -> bool {
        self.handlers.contains_key(payload_type)
    }

    /// Apply one payload; returns `false` when no handler is registered for it.
    pub fn dispatch(
        &self,
        target: &mut T,
        payload_type: &str,
        payload: &[u8],
    ) -> Result<bool, HandlerError> {
        match self.handlers.get(payload_type) {
            Some(handler) => {
                handler(target, payload)?;
                Ok(true)
            }
            None => {
                trace!(payload_type, "no handler registered; skipping");
                Ok(false)
            }
        }
    }

    /// Replay `(payload_type, payload)` pairs into `target`, in order.
    ///
    /// Returns how many were handled.
    pub fn rehydrate<'a, I>(&self, target: &mut T, events: I) -> Result<usize, HandlerError>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut handled = 0;
        for (payload_type, payload) in events {
            handled += usize::from(self.dispatch(target, payload_type, payload)?);
        }
        Ok(handled)
    }
}
