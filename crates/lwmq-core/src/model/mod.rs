// ── Domain model ──
//
// Identity, status, addressing, the mirrored resource tree, the persisted
// record, and the event union. Flat access: `use lwmq_core::model::*`.

pub mod catalog;
pub mod event;
pub mod ids;
pub mod record;
pub mod status;
pub mod tree;

pub use catalog::{Catalog, ResourcePath};
pub use event::ShepherdEvent;
pub use ids::{DeviceId, MacAddress};
pub use record::{AttributeChanges, DeviceAttributes, DeviceRecord};
pub use status::{DeviceStatus, StatusCode};
pub use tree::{Instance, ObjectInstances, ObjectList, ResourceTree};
