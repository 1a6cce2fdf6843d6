//! The key-value store as seen from the scan layer.

mod api;
mod range;

pub mod mem;

pub use api::{
	Document, Entry, Keyed, ResourcePool, ResourceRequest, ResourceStrategy, ScanResource,
};
pub use range::KeyRange;
