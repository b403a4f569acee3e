#[ctor::ctor]
fn init_test_logging() {
    hwv_common::testing::init_global_test_logging();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}
