// SPDX-License-Identifier: MIT OR Apache-2.0
//! Periodic cleanup sweep.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::service::DelegatorService;

/// Spawn the background sweep loop: every interval tick runs one pass of
/// lease expiry, snapshot retention, record retention, and orphan
/// cleanup.
pub fn spawn(service: Arc<DelegatorService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(service.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!("running delegator sweep");
            service.sweep_once().await;
        }
    })
}
