//! Execution contexts and the ordered context registry.
//!
//! The remote application exposes one execution context per isolated
//! evaluation scope (main world, iframes, extension worlds). The peer
//! announces their lifecycle with pushed events; the registry mirrors
//! that lifecycle and preserves announcement order, which is the order
//! the poller and invoker try contexts in.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier the remote peer assigns to an execution context.
pub type ContextId = i64;

// ============================================================================
// Execution Context
// ============================================================================

/// A single evaluation scope exposed by the remote application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Peer-assigned identifier, used as `contextId` in evaluate calls
    pub id: ContextId,

    /// Human-readable name (often empty for the main world)
    #[serde(default)]
    pub name: String,

    /// Security origin of the scope
    #[serde(default)]
    pub origin: String,
}

impl ExecutionContext {
    /// Creates a context with the given id and empty name/origin.
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            name: String::new(),
            origin: String::new(),
        }
    }

    /// Returns a label suitable for log fields.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.origin
        } else {
            &self.name
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        let label = self.label();
        if !label.is_empty() {
            write!(f, " ({label})")?;
        }
        Ok(())
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Context lifecycle change pushed by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// A new context became available
    Created(ExecutionContext),

    /// The context with this id went away
    Destroyed(ContextId),

    /// Every context went away (navigation, reload)
    Cleared,
}

// ============================================================================
// Context Registry
// ============================================================================

/// Ordered collection of live execution contexts.
///
/// Append-only except for explicit removal and clear. A registry has a
/// single writer: the transport's inbound dispatch path. Everyone else
/// works from a point-in-time copy obtained with [`ContextRegistry::to_vec`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextRegistry {
    contexts: Vec<ExecutionContext>,
}

impl ContextRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a lifecycle event.
    ///
    /// Returns `true` if the collection changed.
    pub fn apply(&mut self, event: ContextEvent) -> bool {
        match event {
            ContextEvent::Created(context) => {
                self.contexts.push(context);
                true
            }
            ContextEvent::Destroyed(id) => {
                match self.contexts.iter().position(|c| c.id == id) {
                    Some(index) => {
                        self.contexts.remove(index);
                        true
                    }
                    None => false,
                }
            }
            ContextEvent::Cleared => {
                let changed = !self.contexts.is_empty();
                self.contexts.clear();
                changed
            }
        }
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns true if no contexts are live.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Iterates contexts in announcement order.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionContext> {
        self.contexts.iter()
    }

    /// Returns the ids in announcement order.
    pub fn ids(&self) -> Vec<ContextId> {
        self.contexts.iter().map(|c| c.id).collect()
    }

    /// Returns a point-in-time copy of the collection.
    pub fn to_vec(&self) -> Vec<ExecutionContext> {
        self.contexts.clone()
    }
}
