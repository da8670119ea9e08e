use crate::connection::Connection;
use crate::{BusError, Message, ObjectPath};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Handles method calls for a registered object path.
///
/// `Ok(Some(reply))` is sent back to the caller. `Ok(None)` means the
/// handler replied itself or will reply later. `Err` becomes an Error reply.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, conn: &Connection, msg: &Message)
        -> Result<Option<Message>, BusError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Connection, &Message) -> Result<Option<Message>, BusError> + Send + Sync,
{
    fn handle_message(
        &self,
        conn: &Connection,
        msg: &Message,
    ) -> Result<Option<Message>, BusError> {
        self(conn, msg)
    }
}

/// Runs once when a handler is unregistered.
pub type UnregisterHook = Box<dyn FnOnce(&ObjectPath) + Send>;

struct Registration {
    handler: Arc<dyn MessageHandler>,
    fallback: bool,
    hook: Option<UnregisterHook>,
}

#[derive(Default)]
struct Node {
    /// `None` for a synthetic node that only exists to hold children.
    registration: Option<Registration>,
    children: BTreeSet<String>,
}

/// Where a method call for a path ends up.
pub enum Resolution {
    Handler {
        handler: Arc<dyn MessageHandler>,
        /// The path the handler is registered at; differs from the call's
        /// path when a fallback handler matched.
        registered: ObjectPath,
    },
    /// A node created to hold children; only answers Introspect.
    Synthetic(Vec<String>),
    Missing,
}

/// The tree of exported object paths.
///
/// Registering `/a/b/c` creates synthetic nodes for `/a/b`, `/a` and `/` so
/// introspection can walk down to it. Unregistering prunes every ancestor
/// left without a handler or children.
#[derive(Default)]
pub struct ObjectRegistry {
    nodes: BTreeMap<String, Node>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn register(
        &mut self,
        path: &ObjectPath,
        handler: Arc<dyn MessageHandler>,
        hook: Option<UnregisterHook>,
        fallback: bool,
    ) -> Result<(), BusError> {
        if self
            .nodes
            .get(path.as_str())
            .is_some_and(|n| n.registration.is_some())
        {
            return Err(BusError::DuplicateHandler(path.to_string()));
        }

        let mut child = path.clone();
        while let Some(parent) = child.parent() {
            let name = leaf_name(&child);
            let parent_node = self.nodes.entry(parent.to_string()).or_default();
            let existed = !parent_node.children.insert(name);
            if existed {
                break;
            }
            child = parent;
        }

        self.nodes.entry(path.to_string()).or_default().registration = Some(Registration {
            handler,
            fallback,
            hook,
        });
        debug!("registry: {path} registered (fallback: {fallback})");
        Ok(())
    }

    /// Remove the handler at `path`, returning its hook for the caller to
    /// run outside any lock.
    pub fn unregister(&mut self, path: &ObjectPath) -> Result<Option<UnregisterHook>, BusError> {
        let registration = self
            .nodes
            .get_mut(path.as_str())
            .and_then(|n| n.registration.take())
            .ok_or_else(|| BusError::NotFound(path.to_string()))?;
        self.prune(path.clone());
        debug!("registry: {path} unregistered");
        Ok(registration.hook)
    }

    fn prune(&mut self, mut path: ObjectPath) {
        loop {
            let removable = self
                .nodes
                .get(path.as_str())
                .is_some_and(|n| n.registration.is_none() && n.children.is_empty());
            if !removable {
                return;
            }
            self.nodes.remove(path.as_str());
            let Some(parent) = path.parent() else {
                return;
            };
            if let Some(parent_node) = self.nodes.get_mut(parent.as_str()) {
                parent_node.children.remove(&leaf_name(&path));
            }
            path = parent;
        }
    }

    /// Exact handler first, then an exact synthetic node, then the nearest
    /// fallback ancestor.
    pub fn resolve(&self, path: &ObjectPath) -> Resolution {
        if let Some(node) = self.nodes.get(path.as_str()) {
            return match &node.registration {
                Some(reg) => Resolution::Handler {
                    handler: Arc::clone(&reg.handler),
                    registered: path.clone(),
                },
                None => Resolution::Synthetic(node.children.iter().cloned().collect()),
            };
        }
        let mut current = path.parent();
        while let Some(ancestor) = current {
            if let Some(Some(reg)) = self.nodes.get(ancestor.as_str()).map(|n| &n.registration) {
                if reg.fallback {
                    return Resolution::Handler {
                        handler: Arc::clone(&reg.handler),
                        registered: ancestor,
                    };
                }
            }
            current = ancestor.parent();
        }
        Resolution::Missing
    }

    /// Names of the direct children of `path`, sorted.
    pub fn children(&self, path: &ObjectPath) -> Vec<String> {
        self.nodes
            .get(path.as_str())
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, path: &ObjectPath) -> bool {
        self.nodes
            .get(path.as_str())
            .is_some_and(|n| n.registration.is_some())
    }
}

fn leaf_name(path: &ObjectPath) -> String {
    path.as_str()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_owned()
}
