//! Automation hub — email code relay and webhook notifications.

pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testing;
