//! Process-wide tool registry.
//!
//! The registry is the only shared mutable state of the hub. Every mutation
//! happens under a single write lock, and the observable count and change
//! events are published while that lock is held, so observers see changes
//! in the same order the map went through them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::tool::SharedTool;

/// Capacity of the change-event channel. Slow subscribers lose the oldest
/// events rather than blocking mutators.
const EVENT_CAPACITY: usize = 64;

/// A registry mutation, delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A tool was inserted or replaced
    Registered(String),
    /// A tool was removed
    Removed(String),
    /// The registry was emptied
    Cleared,
}

struct Inner {
    tools: RwLock<HashMap<String, SharedTool>>,
    count: watch::Sender<usize>,
    events: broadcast::Sender<RegistryEvent>,
}

/// Concurrent mapping from tool name to tool implementation.
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct ToolRegistry {
    inner: Arc<Inner>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tools: RwLock::new(HashMap::new()),
                count,
                events,
            }),
        }
    }

    /// Insert `tool`, replacing any tool already registered under its name.
    pub fn register(&self, tool: SharedTool) {
        let name = tool.name().to_string();
        let mut tools = self.inner.tools.write();
        let replaced = tools.insert(name.clone(), tool).is_some();
        self.publish(tools.len(), RegistryEvent::Registered(name.clone()));
        drop(tools);
        debug!(tool = %name, replaced, "tool registered");
    }

    /// Remove the tool named `name`. Returns whether anything was removed;
    /// subscribers are only notified when it was.
    pub fn remove(&self, name: &str) -> bool {
        let mut tools = self.inner.tools.write();
        if tools.remove(name).is_none() {
            return false;
        }
        self.publish(tools.len(), RegistryEvent::Removed(name.to_string()));
        drop(tools);
        debug!(tool = %name, "tool removed");
        true
    }

    pub fn get(&self, name: &str) -> Option<SharedTool> {
        self.inner.tools.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.tools.read().contains_key(name)
    }

    /// Snapshot of every registered tool, sorted by name for display.
    pub fn list(&self) -> Vec<SharedTool> {
        let mut tools: Vec<SharedTool> = self.inner.tools.read().values().cloned().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Sorted snapshot of registered tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove every tool. Always notifies subscribers.
    pub fn clear(&self) {
        let mut tools = self.inner.tools.write();
        tools.clear();
        self.publish(0, RegistryEvent::Cleared);
        drop(tools);
        debug!("registry cleared");
    }

    pub fn count(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// Receiver that always holds the current tool count.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }

    /// Subscribe to change events. Only events published after this call
    /// are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    // Called with the write lock held.
    fn publish(&self, count: usize, event: RegistryEvent) {
        self.inner.count.send_replace(count);
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}
