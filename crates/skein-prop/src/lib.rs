//! Reactive property tree.
//!
//! The tree is the shared state between page handlers and whatever renders
//! them. Nodes are reference counted through [`Prop`] handles, carry a scalar
//! [`PropValue`], and can be watched two ways:
//! - [`Subscription`]s deliver destruction and external events for one node
//!   into a [`Courier`], a blocking per-consumer event queue.
//! - [`PropTree::observe`] broadcasts every structural change to renderers.
//!
//! ## Node lifetime
//!
//! ```text
//! create ──► attached (owned by parent) ──► destroy() ──► zombie ──► freed
//!    │                                                      ▲          ▲
//!    └──► unattached root ── last handle released ──────────┘          │
//!                                              last handle released ───┘
//! ```

mod courier;
mod error;
mod event;
mod tree;
mod value;

pub use courier::Courier;
pub use error::PropError;
pub use event::{ExtEvent, PropEvent, SubFlags, TreeEvent};
pub use tree::{NodeId, Prop, PropTree, Subscription};
pub use value::PropValue;
