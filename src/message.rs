//! Type-erased envelope over an incoming message body

use std::any::{Any, TypeId};

/// A dispatch-scoped envelope carrying one already-deserialized message body.
///
/// Transport and body deserialization happen upstream; by the time a message
/// reaches the saga engine it is a concrete Rust value behind `dyn Any`.
pub struct IncomingMessage {
    body: Box<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl IncomingMessage {
    /// Wrap a concrete message body.
    pub fn new<M: Any + Send + Sync>(body: M) -> Self {
        Self {
            body: Box::new(body),
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
        }
    }

    /// Typed access to the body, `None` if `M` is not the concrete type.
    pub fn body<M: Any>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }

    /// The concrete runtime type of the body.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Human-readable type name of the body, for logs and errors.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("type_name", &self.type_name)
            .finish()
    }
}
