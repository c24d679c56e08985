use crate::messenger::Messenger;
use anyhow::Result;
use helios_db::repositories::LedgerRepository;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

/// Operator announcement to every known user. One failed delivery
/// (blocked bot, deleted account) is logged and skipped; the rest of
/// the run continues.
pub struct BroadcastService {
    ledger: LedgerRepository,
    messenger: Arc<dyn Messenger>,
    /// Delay between sends; zero in tests.
    throttle: Duration,
}

impl BroadcastService {
    pub fn new(
        ledger: LedgerRepository,
        messenger: Arc<dyn Messenger>,
        throttle: Duration,
    ) -> Self {
        Self {
            ledger,
            messenger,
            throttle,
        }
    }

    pub async fn broadcast(&self, text: &str) -> Result<BroadcastReport> {
        let mut report = BroadcastReport::default();
        for tg_id in self.ledger.list_user_ids().await? {
            match self.messenger.send(tg_id, text, None).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(tg_id, "Broadcast delivery failed: {:#}", e);
                    report.failed += 1;
                }
            }
            tokio::time::sleep(self.throttle).await;
        }
        info!(
            sent = report.sent,
            failed = report.failed,
            "Broadcast complete"
        );
        Ok(report)
    }
}
