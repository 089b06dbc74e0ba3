//! Domain types shared by services and transports

pub mod events;
pub mod terminal;
pub mod types;
