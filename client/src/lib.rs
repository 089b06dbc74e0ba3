//! OpsDeck client
//!
//! Keeps a local view of one process consistent with the server: a pure
//! reducer over [`state::ProcessState`], a tracker that publishes it, and the
//! HTTP, SSE and reconciliation plumbing that feeds it actions.

pub mod api;
pub mod controller;
pub mod error;
pub mod reconcile;
pub mod state;
pub mod stream;
pub mod tracker;
pub mod types;

pub use api::{HttpProcessApi, ProcessApi};
pub use controller::ProcessController;
pub use error::{ClientError, Result};
pub use reconcile::Reconciler;
pub use state::{reduce, reduce_with_limit, OutputLog, ProcessAction, ProcessState};
pub use stream::{ConnectionState, EventStream};
pub use tracker::ProcessTracker;
