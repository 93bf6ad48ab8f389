//! Failure detection and checkpoint-based recovery for remote bodies.
//!
//! Two halves share one notion of identity, the [`BodyId`]:
//!
//! - The [`FutureMonitor`] watches pending [`FutureReply`]s and probes
//!   the bodies that owe them a reply. A body that doesn't answer
//!   fails every future it owes.
//! - The [`RecoveryCoordinator`] supervises registered bodies, and on
//!   failure queues a job on its [`WorkerPool`] that restarts the body
//!   from its latest [`Checkpoint`] on another host.
//!
//! [`Supervision`] wires both together from a [`Config`].

pub(crate) mod common;
pub mod config;
pub mod errors;
pub mod future;
pub mod identity;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod recovery;
pub mod run;
pub mod tracing;
pub mod webserver;

pub use common::LoopHandle;
pub use config::Config;
pub use errors::Result;
pub use errors::VigilError;
pub use future::FutureReply;
pub use future::ReplyError;
pub use future::UpdaterFailure;
pub use identity::BodyId;
pub use identity::HostRef;
pub use identity::NodeUrl;
pub use monitor::FutureMonitor;
pub use pool::JobBarrier;
pub use pool::WorkerPool;
pub use recovery::Checkpoint;
pub use recovery::RecoveryCoordinator;
pub use run::Collaborators;
pub use run::Supervision;
