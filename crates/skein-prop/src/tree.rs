//! The property tree itself.
//!
//! All nodes of one tree live in a single arena guarded by one mutex. Handles
//! ([`Prop`]) are reference counts into that arena; the arena never calls back
//! into user code while locked. Courier deliveries and observer broadcasts are
//! both non-blocking sends, so they happen under the lock and keep emission
//! order identical to mutation order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::courier::Courier;
use crate::error::PropError;
use crate::event::{ExtEvent, PropEvent, SubFlags, TreeEvent};
use crate::value::PropValue;

/// Identifier of a node, unique within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Arena
// ============================================================================

struct Node {
    name: Option<String>,
    value: PropValue,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    refs: usize,
    zombie: bool,
    subs: Vec<u64>,
}

struct SubEntry {
    node: NodeId,
    flags: SubFlags,
    tx: Sender<PropEvent>,
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<NodeId, Node>,
    subs: HashMap<u64, SubEntry>,
    next_node: u64,
    next_sub: u64,
}

struct Shared {
    state: Mutex<TreeState>,
    events: broadcast::Sender<TreeEvent>,
}

fn emit(events: &broadcast::Sender<TreeEvent>, event: TreeEvent) {
    // No observers is the common case.
    let _ = events.send(event);
}

impl TreeState {
    fn insert(&mut self, parent: Option<NodeId>, name: Option<&str>) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        self.nodes.insert(
            id,
            Node {
                name: name.map(str::to_string),
                value: PropValue::Void,
                parent,
                children: Vec::new(),
                refs: 0,
                zombie: false,
                subs: Vec::new(),
            },
        );
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.push(id);
        }
        id
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|n| !n.zombie)
    }

    fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let node = self.nodes.get(&parent)?;
        node.children.iter().copied().find(|c| {
            self.nodes
                .get(c)
                .is_some_and(|n| n.name.as_deref() == Some(name))
        })
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.nodes.get_mut(&id).and_then(|n| n.parent.take());
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
    }

    fn is_ancestor(&self, candidate: NodeId, of: NodeId) -> bool {
        let mut cursor = Some(of);
        while let Some(id) = cursor {
            if id == candidate {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn deliver(&self, id: NodeId, wanted: SubFlags, event: PropEvent) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        for sub in node.subs.iter().filter_map(|s| self.subs.get(s)) {
            if sub.flags.contains(wanted) {
                let _ = sub.tx.send(event.clone());
            }
        }
    }

    /// Destroy `root` and everything below it. Nodes still referenced by a
    /// handle linger as zombies; the rest are freed immediately.
    fn zombify(&mut self, root: NodeId, events: &broadcast::Sender<TreeEvent>) {
        self.detach(root);

        let mut stack = vec![root];
        let mut doomed = Vec::new();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.zombie {
                continue;
            }
            node.zombie = true;
            node.parent = None;
            // Reverse so children are visited in insertion order.
            stack.extend(node.children.drain(..).rev());

            self.deliver(id, SubFlags::TRACK_DESTROY, PropEvent::Destroyed);
            emit(events, TreeEvent::Destroyed { id });
            doomed.push(id);
        }

        for id in doomed {
            if self.nodes.get(&id).is_some_and(|n| n.refs == 0) {
                self.nodes.remove(&id);
            }
        }
        tracing::trace!("Destroyed subtree rooted at node {}", root);
    }

    fn release(&mut self, id: NodeId, events: &broadcast::Sender<TreeEvent>) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.refs = node.refs.saturating_sub(1);
        if node.refs > 0 {
            return;
        }
        if node.zombie {
            self.nodes.remove(&id);
        } else if node.parent.is_none() {
            // An unattached node nobody can reach any more.
            self.zombify(id, events);
        }
    }

    fn to_json(&self, id: NodeId) -> serde_json::Value {
        let Some(node) = self.nodes.get(&id) else {
            return serde_json::Value::Null;
        };
        if node.children.is_empty() {
            return serde_json::to_value(&node.value).unwrap_or(serde_json::Value::Null);
        }

        let all_unnamed = node
            .children
            .iter()
            .all(|c| self.nodes.get(c).is_some_and(|n| n.name.is_none()));
        if all_unnamed {
            return serde_json::Value::Array(
                node.children.iter().map(|c| self.to_json(*c)).collect(),
            );
        }

        let mut map = serde_json::Map::new();
        for child in &node.children {
            let key = match self.nodes.get(child).and_then(|n| n.name.clone()) {
                Some(name) => name,
                None => format!("#{}", child),
            };
            map.insert(key, self.to_json(*child));
        }
        serde_json::Value::Object(map)
    }
}

// ============================================================================
// PropTree
// ============================================================================

/// A property tree. Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct PropTree {
    shared: Arc<Shared>,
}

impl PropTree {
    /// Create an empty tree whose observers buffer up to `event_capacity`
    /// structural events before lagging.
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TreeState::default()),
                events,
            }),
        }
    }

    /// Create a node. With a parent and a name, an existing child of that
    /// name is returned instead of creating a duplicate. A destroyed parent
    /// yields an unattached node.
    pub fn create(&self, parent: Option<&Prop>, name: Option<&str>) -> Prop {
        let mut state = self.shared.state.lock();
        let parent = parent
            .filter(|p| p.same_tree(self))
            .map(|p| p.id)
            .filter(|p| state.is_live(*p));

        if let (Some(parent), Some(name)) = (parent, name) {
            if let Some(existing) = state.find_child(parent, name) {
                return self.handle(&mut state, existing);
            }
        }

        let id = state.insert(parent, name);
        emit(
            &self.shared.events,
            TreeEvent::Created {
                id,
                parent,
                name: name.map(str::to_string),
            },
        );
        self.handle(&mut state, id)
    }

    /// Subscribe to structural changes.
    pub fn observe(&self) -> broadcast::Receiver<TreeEvent> {
        self.shared.events.subscribe()
    }

    /// Number of nodes currently held in memory, zombies included.
    pub fn len(&self) -> usize {
        self.shared.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, state: &mut TreeState, id: NodeId) -> Prop {
        if let Some(node) = state.nodes.get_mut(&id) {
            node.refs += 1;
        }
        Prop {
            tree: self.clone(),
            id,
        }
    }
}

impl fmt::Debug for PropTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropTree").finish_non_exhaustive()
    }
}

// ============================================================================
// Prop
// ============================================================================

/// A counted reference to a node.
pub struct Prop {
    tree: PropTree,
    id: NodeId,
}

impl Prop {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> &PropTree {
        &self.tree
    }

    fn same_tree(&self, tree: &PropTree) -> bool {
        Arc::ptr_eq(&self.tree.shared, &tree.shared)
    }

    fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> Option<R> {
        let state = self.tree.shared.state.lock();
        state.nodes.get(&self.id).map(f)
    }

    pub fn name(&self) -> Option<String> {
        self.with_node(|n| n.name.clone()).flatten()
    }

    pub fn value(&self) -> PropValue {
        self.with_node(|n| n.value.clone()).unwrap_or_default()
    }

    /// True once the node has been destroyed.
    pub fn is_zombie(&self) -> bool {
        self.with_node(|n| n.zombie).unwrap_or(true)
    }

    pub fn parent(&self) -> Option<Prop> {
        let mut state = self.tree.shared.state.lock();
        let parent = state.nodes.get(&self.id)?.parent?;
        Some(self.tree.handle(&mut state, parent))
    }

    pub fn children(&self) -> Vec<Prop> {
        let mut state = self.tree.shared.state.lock();
        let ids = state
            .nodes
            .get(&self.id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        ids.into_iter()
            .map(|id| self.tree.handle(&mut state, id))
            .collect()
    }

    /// Look up a direct child by name.
    pub fn child(&self, name: &str) -> Option<Prop> {
        let mut state = self.tree.shared.state.lock();
        let id = state.find_child(self.id, name)?;
        Some(self.tree.handle(&mut state, id))
    }

    /// Find-or-create a named child.
    pub fn create_child(&self, name: &str) -> Prop {
        self.tree.create(Some(self), Some(name))
    }

    /// Resolve a dotted path such as `model.metadata.title`.
    pub fn find(&self, path: &str) -> Option<Prop> {
        let mut state = self.tree.shared.state.lock();
        let mut cursor = self.id;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            cursor = state.find_child(cursor, segment)?;
        }
        Some(self.tree.handle(&mut state, cursor))
    }

    /// Set the node's value. Writes to destroyed nodes are dropped.
    pub fn set(&self, value: impl Into<PropValue>) {
        let value = value.into();
        let mut state = self.tree.shared.state.lock();
        let Some(node) = state.nodes.get_mut(&self.id) else {
            return;
        };
        if node.zombie {
            return;
        }
        node.value = value.clone();
        emit(
            &self.tree.shared.events,
            TreeEvent::Changed { id: self.id, value },
        );
    }

    /// Mirror a JSON value into this node: scalars become the node's value,
    /// object members become named children and array elements unnamed ones.
    pub fn set_json(&self, value: &serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, member) in map {
                    self.create_child(key).set_json(member);
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.tree.create(Some(self), None).set_json(item);
                }
            }
            scalar => self.set(PropValue::from_json(scalar)),
        }
    }

    /// Attach this node under `parent`, moving it if it is already attached
    /// elsewhere.
    pub fn set_parent(&self, parent: &Prop) -> Result<(), PropError> {
        if !Arc::ptr_eq(&self.tree.shared, &parent.tree.shared) {
            return Err(PropError::ForeignTree);
        }
        let mut state = self.tree.shared.state.lock();
        if !state.is_live(parent.id) {
            return Err(PropError::ParentDestroyed);
        }
        if !state.is_live(self.id) {
            return Err(PropError::NodeDestroyed);
        }
        if state.is_ancestor(self.id, parent.id) {
            return Err(PropError::Cycle);
        }

        state.detach(self.id);
        if let Some(node) = state.nodes.get_mut(&self.id) {
            node.parent = Some(parent.id);
        }
        if let Some(p) = state.nodes.get_mut(&parent.id) {
            p.children.push(self.id);
        }
        emit(
            &self.tree.shared.events,
            TreeEvent::Attached {
                id: self.id,
                parent: parent.id,
            },
        );
        Ok(())
    }

    /// Destroy this node and its whole subtree.
    pub fn destroy(&self) {
        let mut state = self.tree.shared.state.lock();
        if state.is_live(self.id) {
            state.zombify(self.id, &self.tree.shared.events);
        }
    }

    /// Send an external event to the node's subscribers. Events sent to
    /// destroyed nodes are dropped.
    pub fn send_event(&self, event: ExtEvent) {
        let state = self.tree.shared.state.lock();
        if state.is_live(self.id) {
            state.deliver(self.id, SubFlags::EXT_EVENTS, PropEvent::External(event));
        }
    }

    /// Deliver this node's events matching `flags` into `courier`.
    ///
    /// Subscribing to an already destroyed node with
    /// [`SubFlags::TRACK_DESTROY`] delivers [`PropEvent::Destroyed`] at once.
    pub fn subscribe(&self, courier: &Courier, flags: SubFlags) -> Subscription {
        let tx = courier.sender();
        let mut state = self.tree.shared.state.lock();
        state.next_sub += 1;
        let sub = state.next_sub;

        let zombie = match state.nodes.get_mut(&self.id) {
            Some(node) => {
                node.subs.push(sub);
                node.zombie
            }
            None => true,
        };
        if zombie && flags.contains(SubFlags::TRACK_DESTROY) {
            let _ = tx.send(PropEvent::Destroyed);
        }
        state.subs.insert(
            sub,
            SubEntry {
                node: self.id,
                flags,
                tx,
            },
        );
        let prop = self.tree.handle(&mut state, self.id);
        Subscription { prop, id: sub }
    }

    /// Render the subtree as JSON. Leaves become their value; nodes whose
    /// children are all unnamed become arrays.
    pub fn to_json(&self) -> serde_json::Value {
        self.tree.shared.state.lock().to_json(self.id)
    }
}

impl Clone for Prop {
    fn clone(&self) -> Self {
        let mut state = self.tree.shared.state.lock();
        self.tree.handle(&mut state, self.id)
    }
}

impl Drop for Prop {
    fn drop(&mut self) {
        let mut state = self.tree.shared.state.lock();
        state.release(self.id, &self.tree.shared.events);
    }
}

impl PartialEq for Prop {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.tree.shared, &other.tree.shared)
    }
}

impl Eq for Prop {}

impl fmt::Debug for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Prop").field(&self.id).finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A live subscription. Dropping it stops delivery.
pub struct Subscription {
    prop: Prop,
    id: u64,
}

impl Subscription {
    /// The subscribed node.
    pub fn prop(&self) -> &Prop {
        &self.prop
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.prop.tree.shared.state.lock();
        if let Some(entry) = state.subs.remove(&self.id) {
            if let Some(node) = state.nodes.get_mut(&entry.node) {
                node.subs.retain(|s| *s != self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("prop", &self.prop)
            .field("id", &self.id)
            .finish()
    }
}
