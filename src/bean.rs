//! CRUD vocabulary shipped over invocations.
//!
//! Beans are plain serde types. They cross the wire as [`BeanDto`]s, property maps built from the
//! bean's serialized form, which can be sorted with a [`BeanDtoComparator`] without knowing the
//! bean's type.

mod dto;
mod provider;
mod remote;
mod repository;
mod sort;

pub use dto::*;
pub use provider::*;
pub use remote::*;
pub use repository::*;
pub use sort::*;
