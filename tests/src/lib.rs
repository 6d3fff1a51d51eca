//! # Unibus Test Suite
//!
//! Scenarios that run the same contract against every adapter through the
//! in-process reference backends.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs      # shared payloads, brokers and wait helpers
//!     ├── delivery.rs      # typed round trip, ack once, redelivery
//!     ├── batching.rs      # size and interval flush on the log adapter
//!     ├── lifecycle.rs     # server registry, driver selection, reconnect
//!     └── propagation.rs   # trace context across publish/subscribe
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p unibus-tests
//! cargo test -p unibus-tests integration::delivery::
//! ```

pub mod integration;
