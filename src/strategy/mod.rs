pub mod definition;
pub mod lifecycle;
pub mod selection;
pub mod triggers;
