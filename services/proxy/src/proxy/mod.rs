//! The data plane: registry, services, backends, balancing, and the
//! byte-shoveling path.
//!
//! ```text
//! Config -> Registry -> Service (listener + accept loop)
//!                           |-> balance policy picks a Backend
//!                           |-> dial upstream, failover on error
//!                           '-> two shovel tasks per connection
//! ```
//!
//! Backend health loops run independently and flip the up/down flag the
//! balancing policies read.

pub mod backend;
pub mod balance;
pub mod registry;
pub mod service;
pub mod shovel;

pub use backend::{Backend, BackendSettings, ConnectionGuard};
pub use balance::RoundRobinState;
pub use registry::Registry;
pub use service::Service;
