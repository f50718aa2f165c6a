//! Campaign and turn contracts
//!
//! Records owned by the orchestrator and persisted through the storage
//! collaborator after every state transition.

mod campaign;
mod turn;

pub use campaign::*;
pub use turn::*;
