//! Background reclamation of profile records
//!
//! One dedicated worker thread wakes on a timer, sweeps the registry to
//! free zero-referenced records, and runs the value-table eviction pass on
//! the records still in use. Waking on a timer rather than on every
//! reference release keeps the cost of `dec_ref` to a single atomic.
//!
//! Stopping is a cooperative handshake: the stopper flips a flag under the
//! monitor, signals, and joins the worker.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use argent_profile::reclaim::{ReclaimConfig, ReclamationWorker};
//! use argent_profile::record::ProfileRegistry;
//!
//! let registry = Arc::new(ProfileRegistry::new());
//! let worker = ReclamationWorker::start(
//!     registry,
//!     ReclaimConfig {
//!         interval: Duration::from_millis(50),
//!         ..ReclaimConfig::default()
//!     },
//! );
//! worker.stop();
//! ```

use crate::record::ProfileRegistry;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Tuning knobs for the reclamation worker
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// How long the worker sleeps between cycles
    pub interval: Duration,
    /// Relative frequency below which a full value table drops an entry
    pub eviction_threshold: f64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            eviction_threshold: 0.01,
        }
    }
}

struct Monitor {
    stop: Mutex<bool>,
    cvar: Condvar,
}

/// The single background thread that frees records and trims value tables
pub struct ReclamationWorker {
    monitor: Arc<Monitor>,
    handle: Option<JoinHandle<()>>,
}

impl ReclamationWorker {
    /// Spawn the worker over `registry`
    pub fn start(registry: Arc<ProfileRegistry>, config: ReclaimConfig) -> Self {
        let monitor = Arc::new(Monitor {
            stop: Mutex::new(false),
            cvar: Condvar::new(),
        });
        let thread_monitor = monitor.clone();
        let handle = thread::Builder::new()
            .name("profile-reclaim".into())
            .spawn(move || {
                debug!("reclamation worker started");
                loop {
                    let stop = thread_monitor.stop.lock().unwrap();
                    // A flag raised while the worker was off the condvar
                    // (before the first wait, or during a cycle) must not
                    // ride out a full interval.
                    if *stop {
                        break;
                    }
                    let (stop, _timeout) = thread_monitor
                        .cvar
                        .wait_timeout(stop, config.interval)
                        .unwrap();
                    if *stop {
                        break;
                    }
                    drop(stop);
                    run_cycle(&registry, &config);
                }
                debug!("reclamation worker stopped");
            })
            .expect("failed to spawn reclamation worker");
        Self {
            monitor,
            handle: Some(handle),
        }
    }

    fn signal_stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            *self.monitor.stop.lock().unwrap() = true;
            self.monitor.cvar.notify_all();
            let _ = handle.join();
        }
    }

    /// Signal the worker and block until it acknowledges and exits
    pub fn stop(mut self) {
        self.signal_stop();
    }
}

impl Drop for ReclamationWorker {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

/// One reclamation cycle: free what reached zero, trim what is still live
///
/// Runs only on the worker thread; the registry sweep relies on that.
fn run_cycle(registry: &ProfileRegistry, config: &ReclaimConfig) {
    let reclaimed = registry.sweep(|record| {
        if !record.is_active() {
            return;
        }
        let Some(values) = record.values() else {
            return;
        };
        for site in values.sites() {
            if !site.evict_low_frequency(config.eviction_threshold) {
                site.reset_if_dominated();
            }
        }
    });
    if reclaimed > 0 {
        debug!(reclaimed, footprint = registry.footprint(), "reclaimed profile records");
    } else {
        trace!(footprint = registry.footprint(), "reclamation cycle found nothing to free");
    }
}
