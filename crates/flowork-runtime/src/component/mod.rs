//! Component data model: kinds, descriptors and registry records.

mod descriptor;
mod kind;
mod record;

pub use descriptor::{Behavior, ComponentDescriptor, EntryPoint};
pub use kind::{ComponentKind, IsolationStrategy, KindPolicy};
pub use record::ComponentRecord;
