//! Attribute surfaces: which fields each action may read or write.

pub mod attributes;
pub mod describe;

pub use attributes::{AttributeSurface, PayloadMode};
pub use describe::{describe_resource, AttributeDescription, ResourceDescription};
