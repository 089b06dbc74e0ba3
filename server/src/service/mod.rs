//! Service layer

pub mod events;
pub mod output;
pub mod process;
pub mod terminal;
