//! Per-tab task supervision — crash isolation.
//!
//! Each tab's work (driving a load, embedder callbacks) runs in its own
//! Tokio task. A panic in that task is caught at the join point and
//! becomes a `Crashed` state on that one tab plus a persisted crash
//! report. The supervisor, the registry, and every other tab keep
//! going.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{TabId, TabRegistry};
use crate::crash::CrashReporter;

pub struct TabSupervisor {
    registry: Arc<RwLock<TabRegistry>>,
    reporter: Arc<CrashReporter>,
}

impl TabSupervisor {
    pub fn new(registry: Arc<RwLock<TabRegistry>>, reporter: Arc<CrashReporter>) -> Self {
        Self { registry, reporter }
    }

    /// Run one tab's work to completion, containing failure:
    ///
    /// - an `Err` return is a failed load (tab back to `Dormant`);
    /// - a panic marks the tab `Crashed` and records a report.
    pub async fn supervise<F>(&self, id: TabId, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let mut reg = self.registry.write().await;
                if let Err(reg_err) = reg.fail_load(id, &e.to_string()) {
                    debug!(tab = %id, err = %reg_err, "failed load on missing or settled tab");
                }
            }
            Err(join_err) if join_err.is_panic() => {
                let reason = panic_message(join_err.into_panic());
                warn!(tab = %id, reason = %reason, "tab task panicked — isolating");
                let url = {
                    let mut reg = self.registry.write().await;
                    let url = reg.get(id).and_then(|t| t.url.clone());
                    if let Err(reg_err) = reg.mark_crashed(id, &reason) {
                        debug!(tab = %id, err = %reg_err, "crash on missing or settled tab");
                    }
                    url
                };
                self.reporter
                    .record(url.as_ref().map(url::Url::as_str), &reason)
                    .await;
            }
            Err(join_err) => {
                // Cancelled task — shutdown path, nothing to report.
                debug!(tab = %id, err = %join_err, "tab task cancelled");
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
