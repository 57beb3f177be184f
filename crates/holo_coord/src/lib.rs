//! HoloCoord: a distributed transaction coordinator.
//!
//! Global transactions (saga, TCC, XA, two-phase messages) and their branches
//! live in a [`store::TransStore`]. Any number of coordinator replicas can
//! share one store: status changes are compare-and-swap, and the recovery
//! [`scheduler`] hands out work through timestamp leases.

pub mod branch_writer;
pub mod config;
pub mod coordinator;
pub mod cron;
pub mod engine;
pub mod invoke;
pub mod model;
pub mod node;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use config::{CoordConfig, ListArgs, NodeArgs, StoreDriver};
pub use coordinator::{gen_gid, Coordinator, TransRequest};
pub use engine::{Engine, EngineConfig, Trans};
pub use node::{run_node, run_node_with_shutdown, Node};
pub use store::{open_store, StoreError, TransStore};
