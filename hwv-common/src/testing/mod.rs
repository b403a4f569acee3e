//! Test support shared by the workspace's unit and integration tests.

mod log;

pub use log::{TestGuard, init_global_test_logging};
