//! # Matrix Module
//!
//! The triad matrix: a cube of edge `dimensions` in which every triad sits at
//! an integer position. Validation scores a triad by its neighbors.
//!
//! ```text
//! triad.rs      Triad and Position types, id generation
//! consensus.rs  Spatial consensus scoring (pure functions)
//! store.rs      TriadStore: in-memory index over MatrixDB, lifecycle, events
//! events.rs     MatrixEvent notifications
//! ```
//!
//! The neighbor graph is never stored. Only positions are persisted, and
//! connections are recomputed from them at each validation.

pub mod consensus;
pub mod events;
pub mod store;
pub mod triad;

pub use consensus::{connection_score, consensus_score, find_connections, Connection};
pub use events::MatrixEvent;
pub use store::{MatrixError, MatrixResult, MatrixSnapshot, TriadStore};
pub use triad::{generate_triad_id, now_millis, Position, Triad};
