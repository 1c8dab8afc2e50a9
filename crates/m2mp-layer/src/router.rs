use std::collections::BTreeMap;
use std::sync::Mutex;

use m2mp_channel::Verbosity;
use m2mp_packet::{hex, Packet};
use tracing::debug;

#[derive(Debug, Default)]
struct Node {
    registered: bool,
    children: BTreeMap<u8, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        !self.registered && self.children.is_empty()
    }

    /// Unmark `prefix` below this node and prune what is left empty.
    /// Returns true if the prefix was registered.
    fn remove(&mut self, prefix: &[u8]) -> bool {
        match prefix.split_first() {
            None => std::mem::take(&mut self.registered),
            Some((first, rest)) => {
                let Some(child) = self.children.get_mut(first) else {
                    return false;
                };
                let removed = child.remove(rest);
                if child.is_empty() {
                    self.children.remove(first);
                }
                removed
            }
        }
    }
}

/// Decides which incoming messages are delivered locally, by prefix match
/// on the first payload bytes of fragment 0.
#[derive(Debug)]
pub struct MessageRouter {
    root: Mutex<Node>,
    debug_filters: Verbosity,
}

impl MessageRouter {
    pub fn new(debug_filters: Verbosity) -> Self {
        Self {
            root: Mutex::new(Node::default()),
            debug_filters,
        }
    }

    /// Register `prefix`. The empty prefix accepts every message.
    pub fn add_message_filter(&self, prefix: &[u8]) {
        let mut root = self.lock();
        let mut node = &mut *root;
        for byte in prefix {
            node = node.children.entry(*byte).or_default();
        }
        node.registered = true;
        self.log_filter("message filter added", prefix);
    }

    /// Unregister `prefix`. Prefixes sharing nodes with it are unaffected.
    pub fn remove_message_filter(&self, prefix: &[u8]) {
        let removed = self.lock().remove(prefix);
        if removed {
            self.log_filter("message filter removed", prefix);
        }
    }

    /// Walk the payload of `packet` from its first byte and report whether a
    /// registered prefix matches. The packet's read position is left after
    /// the bytes consumed by the walk.
    pub fn accept_message(&self, packet: &mut Packet) -> bool {
        packet.rewind();
        let root = self.lock();
        let mut node = &*root;
        loop {
            if node.registered {
                return true;
            }
            let Ok(byte) = packet.get() else {
                return false;
            };
            match node.children.get(&byte) {
                Some(child) => node = child,
                None => return false,
            }
        }
    }

    fn log_filter(&self, action: &str, prefix: &[u8]) {
        if self.debug_filters.detailed() {
            debug!(len = prefix.len(), prefix = %hex(prefix), "{action}");
        } else if self.debug_filters.summary() {
            debug!(len = prefix.len(), "{action}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Node> {
        self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(Verbosity::QUIET)
    }
}
