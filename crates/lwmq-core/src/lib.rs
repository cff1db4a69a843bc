//! Device-management middle tier for LWM2M-style devices over a pub/sub broker.
//!
//! - **[`Shepherd`]**: Central facade. Dispatches inbound broker messages
//!   (register, update, deregister, notify, response, ping, lwt), owns the
//!   device registry, and exposes remote operations per device.
//!
//! - **[`DeviceNode`]**: One remote device: attributes, a mirrored
//!   resource tree (oid → iid → rid → value), liveness status and timers.
//!   Remote operations (`read`, `write`, `observe`, ...) fold good replies
//!   back into the tree and persist them.
//!
//! - **[`diff`]**: Pure diff/patch engine over JSON values. Diffs are
//!   partial and never grow the schema of the target.
//!
//! - **Collaborators**: [`Transport`] publishes outbound messages,
//!   [`DocumentStore`] persists device records ([`MemoryStore`] is the
//!   in-process implementation), and [`SecurityHooks`] seals payloads and
//!   authorizes clients.
//!
//! - **Domain model** ([`model`]): Identity, status codes, the object
//!   catalog, the resource tree, and the [`ShepherdEvent`] union delivered
//!   through [`Shepherd::events()`].

pub mod config;
pub mod correlation;
pub mod diff;
mod dispatch;
pub mod error;
mod liveness;
pub mod model;
pub mod node;
mod registry;
pub mod shepherd;
pub mod store;
pub mod transport;
pub mod wire;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::ShepherdConfig;
pub use correlation::Reply;
pub use error::CoreError;
pub use node::DeviceNode;
pub use shepherd::Shepherd;
pub use store::{DocumentStore, MemoryStore, StoreError};
pub use transport::{InboundMessage, PassThrough, SecurityHooks, Transport, TransportError};
pub use wire::{Command, Interface};

pub use model::{
    AttributeChanges, Catalog, DeviceAttributes, DeviceId, DeviceRecord, DeviceStatus,
    MacAddress, ObjectList, ResourcePath, ResourceTree, ShepherdEvent, StatusCode,
};
