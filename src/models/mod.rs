//! Data models

mod certificate;
mod event;
mod relation;

pub use certificate::*;
pub use event::*;
pub use relation::*;
