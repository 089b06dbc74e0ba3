//! Infrastructure layer

pub mod pty;
pub mod shell;
pub mod signal;
