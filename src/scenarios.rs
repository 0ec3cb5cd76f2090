//! End-to-end scenario tests exercising components, ports, activities and
//! the engine together, rather than one module in isolation.

/// Installs a `tracing` subscriber controlled by `RUST_LOG`, once per test
/// binary. Scenario tests that want to see trigger-coalescing or farm
/// dispatch logs call this first; harmless to call more than once.
#[cfg(test)]
pub(crate) fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod echo_data_channel;
#[cfg(test)]
mod backpressure_buffer;
#[cfg(test)]
mod circular_overwrite;
#[cfg(test)]
mod farm_fanout;
#[cfg(test)]
mod wait_all_trigger;
#[cfg(test)]
mod same_activity_downgrade;
