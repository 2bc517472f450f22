//! Test utilities for the lifecycle engine.
//!
//! Only available with the `testing` feature or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! lifecycle = { path = "../lifecycle", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use lifecycle::testing::{PolicyBuilder, ScriptedDriver, TargetBuilder};
//!
//! let policy = PolicyBuilder::new("compress-old-sales", "sales")
//!     .compress("HIGH")
//!     .older_than_days(90)
//!     .build();
//! let target = TargetBuilder::new("sales", "orders").aged_days(120, now).build();
//! let driver = ScriptedDriver::new().with_compression_ratio(0.4);
//! ```

mod builders;
mod driver;
mod store;

pub use builders::{PolicyBuilder, TargetBuilder};
pub use driver::{DriverCall, ScriptedDriver};
pub use store::FaultyStore;
