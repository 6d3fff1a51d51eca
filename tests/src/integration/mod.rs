//! Cross-adapter scenarios.

#[cfg(test)]
mod fixtures;

pub mod batching;
pub mod delivery;
pub mod lifecycle;
pub mod propagation;
