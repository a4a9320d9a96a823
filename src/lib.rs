pub mod app;
pub mod bootstrap;
pub mod config;
pub mod coordination;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod models;
pub mod sessions;
pub mod signal;
pub mod store;
pub mod watch;
#[cfg(feature = "zookeeper")]
pub mod zk;

pub use app::{router, AppState};
pub use coordination::CoordinationClient;
pub use locks::LockManager;
pub use store::MemoryEnsemble;
