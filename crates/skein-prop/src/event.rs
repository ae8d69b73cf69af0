//! Events delivered by the tree.

use bitflags::bitflags;

use crate::tree::NodeId;
use crate::value::PropValue;

/// An event sent by a consumer (e.g. a renderer) to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExtEvent {
    /// The consumer wants more children appended to this node.
    AppendRequest,
}

/// An event delivered to a [`crate::Subscription`] through its courier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropEvent {
    /// The subscribed node was destroyed.
    Destroyed,

    /// An external event was sent to the subscribed node.
    External(ExtEvent),
}

bitflags! {
    /// What a subscription wants to hear about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubFlags: u8 {
        /// Deliver [`PropEvent::Destroyed`] when the node is destroyed.
        const TRACK_DESTROY = 0b01;
        /// Deliver [`PropEvent::External`] events sent to the node.
        const EXT_EVENTS = 0b10;
    }
}

/// Structural change broadcast to tree observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    Created {
        id: NodeId,
        parent: Option<NodeId>,
        name: Option<String>,
    },
    Changed {
        id: NodeId,
        value: PropValue,
    },
    Attached {
        id: NodeId,
        parent: NodeId,
    },
    Destroyed {
        id: NodeId,
    },
}
