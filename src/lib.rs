pub mod codec;
pub mod config;
pub mod lifecycle;
pub mod mailbox;
pub mod manager;
pub mod metric;
pub mod plugin;
pub mod process;
pub mod scheduler;
/// Search-backend persistence for `store` and `storeOnly` clusters.
pub mod store;
pub mod transport;
