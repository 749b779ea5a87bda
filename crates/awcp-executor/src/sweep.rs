// SPDX-License-Identifier: MIT OR Apache-2.0
//! Periodic cleanup sweep.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::service::ExecutorService;

/// Spawn the background sweep loop: lease expiry, record retention,
/// stale chunk transfers, orphan work directories.
pub fn spawn(service: Arc<ExecutorService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(service.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!("running executor sweep");
            service.sweep_once().await;
        }
    })
}
