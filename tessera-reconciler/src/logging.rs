//! Tracing and lock diagnostics setup.
//!
//! ## Usage
//!
//! Call [`init_tracing`] once from the embedding application. `RUST_LOG`
//! overrides the default filter.

/// Installs a pretty `tracing` subscriber. Does nothing when a global
/// subscriber is already set.
pub fn init_tracing() {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match tracing_subscriber::EnvFilter::try_new("error,tessera_reconciler=info") {
            Ok(filter) => filter,
            Err(_) => tracing_subscriber::EnvFilter::new("error"),
        },
    };

    let _ = tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .try_init();
}

/// Starts a background thread that reports `parking_lot` deadlocks in debug
/// builds. Wakeables, inboxes and stores are locked from foreign threads, so
/// this is the first thing to enable when a resolve appears to hang.
pub fn init_deadlock_detection() {
    #[cfg(debug_assertions)]
    {
        use std::{sync::Once, thread, time::Duration};

        static INIT: Once = Once::new();
        INIT.call_once(|| {
            thread::spawn(|| {
                loop {
                    thread::sleep(Duration::from_secs(10));
                    let deadlocks = parking_lot::deadlock::check_deadlock();
                    if deadlocks.is_empty() {
                        continue;
                    }

                    tracing::error!("{} deadlocks detected", deadlocks.len());
                    for (idx, threads) in deadlocks.iter().enumerate() {
                        tracing::error!("Deadlock #{}", idx);
                        for thread in threads {
                            tracing::error!("Thread Id {:#?}", thread.thread_id());
                            tracing::error!("{:?}", thread.backtrace());
                        }
                    }
                }
            });
        });
    }
}
