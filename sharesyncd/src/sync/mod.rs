pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod foreground;
pub mod gate;
pub mod local;
pub mod local_watcher;
pub mod messages;
pub mod ops;
pub mod paths;
pub mod pipeline;
pub mod reconcile;
pub mod runtime;
pub mod share;
pub mod store;
pub mod transfer;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;
