use crate::config::{Config, RENEWAL_DAYS, RENEWAL_FEE};
use crate::messenger::{Action, Messenger};
use crate::panel::PanelApi;
use crate::texts;
use anyhow::Result;
use helios_db::error::StoreError;
use helios_db::models::{Key, NotifyThreshold};
use helios_db::repositories::{KeyRepository, LedgerRepository};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Outcome counters for one sweep, logged after every tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub warned_10h: usize,
    pub warned_24h: usize,
    pub renewed: usize,
    pub revoked: usize,
    pub failures: usize,
}

/// The periodic key-lifecycle sweep: warning notifications at the 24h
/// and 10h marks, then renew-or-revoke for expired keys. One tick runs
/// to completion before the next is scheduled; per-record failures are
/// logged and never abort the batch.
pub struct LifecycleService {
    keys: KeyRepository,
    ledger: LedgerRepository,
    panel: Arc<dyn PanelApi>,
    messenger: Arc<dyn Messenger>,
    config: Arc<Config>,
    /// Delay between outbound messages; zero in tests.
    throttle: Duration,
}

impl LifecycleService {
    pub fn new(
        keys: KeyRepository,
        ledger: LedgerRepository,
        panel: Arc<dyn PanelApi>,
        messenger: Arc<dyn Messenger>,
        config: Arc<Config>,
        throttle: Duration,
    ) -> Self {
        Self {
            keys,
            ledger,
            panel,
            messenger,
            config,
            throttle,
        }
    }

    /// Runs one sweep at `now_ms`. Batch order is fixed: 10h warnings,
    /// then 24h warnings, then expired handling, each batch
    /// soonest-expiry first.
    pub async fn run_tick(&self, now_ms: i64) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.warn_batch(now_ms, 10 * HOUR_MS, NotifyThreshold::Hours10, &mut report)
            .await;
        self.warn_batch(now_ms, 24 * HOUR_MS, NotifyThreshold::Hours24, &mut report)
            .await;
        self.handle_expired(now_ms, &mut report).await;

        info!(
            warned_10h = report.warned_10h,
            warned_24h = report.warned_24h,
            renewed = report.renewed,
            revoked = report.revoked,
            failures = report.failures,
            "Lifecycle tick complete"
        );
        Ok(report)
    }

    async fn warn_batch(
        &self,
        now_ms: i64,
        window_ms: i64,
        threshold: NotifyThreshold,
        report: &mut TickReport,
    ) {
        let keys = match self
            .keys
            .list_expiring_between(now_ms, now_ms + window_ms, threshold)
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                error!("Failed to query expiring keys: {:#}", e);
                report.failures += 1;
                return;
            }
        };

        for key in keys {
            if let Err(e) = self.warn_one(now_ms, &key, threshold, report).await {
                warn!(client_id = %key.client_id, "Warning failed: {:#}", e);
                report.failures += 1;
            }
            tokio::time::sleep(self.throttle).await;
        }
    }

    async fn warn_one(
        &self,
        now_ms: i64,
        key: &Key,
        threshold: NotifyThreshold,
        report: &mut TickReport,
    ) -> Result<()> {
        // A blocked user is skipped silently and the flag stays unset,
        // so the warning gets another chance on a later tick.
        if self.messenger.is_blocked(key.tg_id).await {
            return Ok(());
        }

        let server_name = self.config.server_name(&key.server_id);
        let text = match threshold {
            NotifyThreshold::Hours10 => {
                texts::key_expiry_10h(server_name, &key.email, key.expiry_time)
            }
            NotifyThreshold::Hours24 => {
                let hours_left = ((key.expiry_time - now_ms) / HOUR_MS).max(0);
                let balance = self.ledger.get_balance(key.tg_id).await?;
                texts::key_expiry_24h(
                    server_name,
                    &key.email,
                    hours_left,
                    key.expiry_time,
                    balance,
                )
            }
        };

        // A failed send leaves the flag unset too; the flag is only
        // committed once the message went out.
        self.messenger
            .send(
                key.tg_id,
                &text,
                Some(Action::RenewKey(key.client_id.clone())),
            )
            .await?;
        self.keys.mark_notified(&key.client_id, threshold).await?;

        match threshold {
            NotifyThreshold::Hours10 => report.warned_10h += 1,
            NotifyThreshold::Hours24 => report.warned_24h += 1,
        }
        Ok(())
    }

    async fn handle_expired(&self, now_ms: i64, report: &mut TickReport) {
        let keys = match self.keys.list_expired(now_ms).await {
            Ok(keys) => keys,
            Err(e) => {
                error!("Failed to query expired keys: {:#}", e);
                report.failures += 1;
                return;
            }
        };

        for key in keys {
            let result = match self.ledger.debit(key.tg_id, RENEWAL_FEE).await {
                Ok(()) => self.renew(now_ms, &key, report).await,
                Err(StoreError::InsufficientBalance) => self.revoke(&key, report).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(client_id = %key.client_id, "Expired-key handling failed: {:#}", e);
                report.failures += 1;
            }
            tokio::time::sleep(self.throttle).await;
        }
    }

    /// Fee already debited: advance the registry, then the panel. A
    /// panel failure leaves the registry advanced and flags the key for
    /// operator follow-up instead of silently diverging.
    async fn renew(&self, now_ms: i64, key: &Key, report: &mut TickReport) -> Result<()> {
        // Resolve the server before touching the registry; bailing out
        // later would leave the key advanced with the panel untouched.
        let Some(server) = self.config.server(&key.server_id) else {
            self.ledger.credit(key.tg_id, RENEWAL_FEE).await?;
            anyhow::bail!("unknown server {}", key.server_id);
        };

        let new_expiry = now_ms + RENEWAL_DAYS * DAY_MS;
        self.keys.extend_key(&key.client_id, new_expiry).await?;

        match self
            .panel
            .renew_credential(server, key.tg_id, &key.client_id, &key.email, new_expiry)
            .await
        {
            Ok(()) => {
                report.renewed += 1;
                let balance = self.ledger.get_balance(key.tg_id).await?;
                self.notify(
                    key.tg_id,
                    &texts::key_renewed(&key.email, new_expiry, balance),
                )
                .await;
            }
            Err(e) => {
                error!(client_id = %key.client_id, "Panel renew failed: {}", e);
                self.keys.mark_inconsistent(&key.client_id).await?;
                report.failures += 1;
                self.notify(key.tg_id, &texts::key_renewal_failed(&key.email))
                    .await;
            }
        }
        Ok(())
    }

    /// Balance below the fee: the registry record goes first and is
    /// removed regardless of the panel outcome.
    async fn revoke(&self, key: &Key, report: &mut TickReport) -> Result<()> {
        self.keys.delete_key(&key.client_id).await?;
        report.revoked += 1;

        let server = self
            .config
            .server(&key.server_id)
            .ok_or_else(|| anyhow::anyhow!("unknown server {}", key.server_id))?;

        let text = match self.panel.delete_credential(server, &key.client_id).await {
            Ok(()) => texts::key_deleted(&key.email),
            Err(e) => {
                error!(client_id = %key.client_id, "Panel delete failed: {}", e);
                report.failures += 1;
                texts::key_deletion_failed(&key.email)
            }
        };
        self.notify(key.tg_id, &text).await;
        Ok(())
    }

    /// Best-effort outcome notice; delivery failures are logged only.
    async fn notify(&self, tg_id: i64, text: &str) {
        if let Err(e) = self
            .messenger
            .send(tg_id, text, Some(Action::ViewProfile))
            .await
        {
            warn!(tg_id, "Outcome notice failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::panel::{CreateCredential, PanelError};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockPanel {
        renews: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
        fail_renew: bool,
        fail_delete: bool,
    }

    #[async_trait]
    impl PanelApi for MockPanel {
        async fn create_credential(
            &self,
            _server: &ServerConfig,
            _credential: &CreateCredential,
        ) -> Result<(), PanelError> {
            Ok(())
        }

        async fn renew_credential(
            &self,
            _server: &ServerConfig,
            _tg_id: i64,
            client_id: &str,
            _email: &str,
            _new_expiry_time: i64,
        ) -> Result<(), PanelError> {
            self.renews.lock().unwrap().push(client_id.to_string());
            if self.fail_renew {
                return Err(PanelError::Api("update refused".into()));
            }
            Ok(())
        }

        async fn delete_credential(
            &self,
            _server: &ServerConfig,
            client_id: &str,
        ) -> Result<(), PanelError> {
            self.deletes.lock().unwrap().push(client_id.to_string());
            if self.fail_delete {
                return Err(PanelError::Api("delete refused".into()));
            }
            Ok(())
        }

        async fn connection_uri(
            &self,
            _server: &ServerConfig,
            _client_id: &str,
            _email: &str,
        ) -> Result<String, PanelError> {
            Ok("vless://mock".into())
        }
    }

    #[derive(Default)]
    struct MockMessenger {
        sent: Mutex<Vec<(i64, String, Option<Action>)>>,
        blocked: HashSet<i64>,
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        async fn is_blocked(&self, tg_id: i64) -> bool {
            self.blocked.contains(&tg_id)
        }

        async fn send(&self, tg_id: i64, text: &str, action: Option<Action>) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((tg_id, text.to_string(), action));
            Ok(())
        }

        async fn send_document(&self, _chat_id: i64, _path: &std::path::Path) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Arc<Config> {
        let mut servers = HashMap::new();
        servers.insert(
            "nl-1".to_string(),
            ServerConfig {
                name: "Netherlands 1".into(),
                api_url: "http://localhost:1".into(),
                domain: "nl1.example.com".into(),
                public_key: "pbk".into(),
                sni: "telegram.org".into(),
                short_id: "ab12".into(),
                prefix: "helios-nl".into(),
                subscription_base: "http://localhost:1/sub".into(),
            },
        );
        Arc::new(Config {
            bot_token: "test".into(),
            database_url: "sqlite::memory:".into(),
            admin_chat_id: 1,
            panel_username: "admin".into(),
            panel_password: "admin".into(),
            backup_dir: "backups".into(),
            bind_addr: "127.0.0.1:0".into(),
            servers,
        })
    }

    struct Fixture {
        keys: KeyRepository,
        ledger: LedgerRepository,
        panel: Arc<MockPanel>,
        messenger: Arc<MockMessenger>,
        service: LifecycleService,
    }

    async fn fixture_with(panel: MockPanel, messenger: MockMessenger) -> Fixture {
        let pool = helios_db::connect_memory().await.unwrap();
        let keys = KeyRepository::new(pool.clone());
        let ledger = LedgerRepository::new(pool);
        let panel = Arc::new(panel);
        let messenger = Arc::new(messenger);
        let service = LifecycleService::new(
            keys.clone(),
            ledger.clone(),
            panel.clone(),
            messenger.clone(),
            test_config(),
            Duration::ZERO,
        );
        Fixture {
            keys,
            ledger,
            panel,
            messenger,
            service,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(MockPanel::default(), MockMessenger::default()).await
    }

    const NOW: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn expired_key_with_funds_is_renewed() {
        let f = fixture().await;
        f.ledger.credit(42, 150).await.unwrap();
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW - 1, "vless://x")
            .await
            .unwrap();

        let report = f.service.run_tick(NOW).await.unwrap();
        assert_eq!(report.renewed, 1);
        assert_eq!(report.revoked, 0);

        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 50);
        let key = f.keys.get("k1").await.unwrap().unwrap();
        assert_eq!(key.expiry_time, NOW + 30 * DAY_MS);
        assert!(!key.inconsistent);
        assert_eq!(*f.panel.renews.lock().unwrap(), vec!["k1"]);

        let sent = f.messenger.sent.lock().unwrap();
        let renewal_notices: Vec<_> =
            sent.iter().filter(|(_, t, _)| t.contains("renewed")).collect();
        assert_eq!(renewal_notices.len(), 1);
        assert_eq!(renewal_notices[0].0, 42);
    }

    #[tokio::test]
    async fn expired_key_without_funds_is_revoked() {
        let f = fixture().await;
        f.ledger.credit(42, 50).await.unwrap();
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW - 1, "vless://x")
            .await
            .unwrap();

        let report = f.service.run_tick(NOW).await.unwrap();
        assert_eq!(report.revoked, 1);
        assert_eq!(report.renewed, 0);

        assert!(f.keys.get("k1").await.unwrap().is_none());
        // The insufficient balance stays untouched.
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 50);
        assert_eq!(*f.panel.deletes.lock().unwrap(), vec!["k1"]);
        assert!(f.panel.renews.lock().unwrap().is_empty());

        let sent = f.messenger.sent.lock().unwrap();
        assert!(sent.iter().any(|(id, t, _)| *id == 42 && t.contains("removed")));
    }

    #[tokio::test]
    async fn five_hour_key_gets_only_the_10h_warning() {
        let f = fixture().await;
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW + 5 * HOUR_MS, "vless://x")
            .await
            .unwrap();
        f.keys
            .mark_notified("k1", NotifyThreshold::Hours24)
            .await
            .unwrap();

        let report = f.service.run_tick(NOW).await.unwrap();
        assert_eq!(report.warned_10h, 1);
        assert_eq!(report.warned_24h, 0);

        let key = f.keys.get("k1").await.unwrap().unwrap();
        assert!(key.notified_10h);

        let sent = f.messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("10 hours"));
        assert_eq!(sent[0].2, Some(Action::RenewKey("k1".into())));
    }

    #[tokio::test]
    async fn warnings_fire_at_most_once_per_expiry_epoch() {
        let f = fixture().await;
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW + 5 * HOUR_MS, "vless://x")
            .await
            .unwrap();

        f.service.run_tick(NOW).await.unwrap();
        let second = f.service.run_tick(NOW + HOUR_MS).await.unwrap();
        assert_eq!(second.warned_10h, 0);
        assert_eq!(second.warned_24h, 0);

        // One 10h and one 24h warning total, never repeated.
        let sent = f.messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn blocked_user_is_skipped_without_marking() {
        let mut messenger = MockMessenger::default();
        messenger.blocked.insert(42);
        let f = fixture_with(MockPanel::default(), messenger).await;
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW + 5 * HOUR_MS, "vless://x")
            .await
            .unwrap();

        let report = f.service.run_tick(NOW).await.unwrap();
        assert_eq!(report.warned_10h, 0);

        let key = f.keys.get("k1").await.unwrap().unwrap();
        assert!(!key.notified_10h);
        assert!(!key.notified_24h);
        assert!(f.messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panel_renew_failure_flags_the_key_inconsistent() {
        let panel = MockPanel {
            fail_renew: true,
            ..Default::default()
        };
        let f = fixture_with(panel, MockMessenger::default()).await;
        f.ledger.credit(42, 200).await.unwrap();
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW - 1, "vless://x")
            .await
            .unwrap();

        let report = f.service.run_tick(NOW).await.unwrap();
        assert_eq!(report.renewed, 0);
        assert_eq!(report.failures, 1);

        // Registry advanced, fee debited, divergence flagged.
        let key = f.keys.get("k1").await.unwrap().unwrap();
        assert_eq!(key.expiry_time, NOW + 30 * DAY_MS);
        assert!(key.inconsistent);
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 100);

        let sent = f.messenger.sent.lock().unwrap();
        assert!(sent.iter().any(|(_, t, _)| t.contains("could not renew")));
    }

    #[tokio::test]
    async fn panel_delete_failure_still_removes_the_record() {
        let panel = MockPanel {
            fail_delete: true,
            ..Default::default()
        };
        let f = fixture_with(panel, MockMessenger::default()).await;
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW - 1, "vless://x")
            .await
            .unwrap();

        f.service.run_tick(NOW).await.unwrap();
        assert!(f.keys.get("k1").await.unwrap().is_none());

        let sent = f.messenger.sent.lock().unwrap();
        assert!(sent.iter().any(|(_, t, _)| t.contains("cleanup did not go through")));
    }

    #[tokio::test]
    async fn one_bad_record_does_not_abort_the_batch() {
        let f = fixture().await;
        // Key on an unknown server fails server lookup mid-batch.
        f.ledger.credit(1, 200).await.unwrap();
        f.ledger.credit(2, 200).await.unwrap();
        f.keys
            .create_key(1, "bad", "ghost", "a", NOW - 100, "vless://x")
            .await
            .unwrap();
        f.keys
            .create_key(2, "good", "nl-1", "b", NOW - 50, "vless://x")
            .await
            .unwrap();

        let report = f.service.run_tick(NOW).await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.renewed, 1);
        assert_eq!(*f.panel.renews.lock().unwrap(), vec!["good"]);
    }

    #[tokio::test]
    async fn unknown_server_leaves_registry_and_fee_untouched() {
        let f = fixture().await;
        f.ledger.credit(1, 200).await.unwrap();
        f.keys
            .create_key(1, "k1", "ghost", "a", NOW - 100, "vless://x")
            .await
            .unwrap();

        let report = f.service.run_tick(NOW).await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.renewed, 0);

        // Fee refunded, expiry not advanced, nothing flagged.
        assert_eq!(f.ledger.get_balance(1).await.unwrap(), 200);
        let key = f.keys.get("k1").await.unwrap().unwrap();
        assert_eq!(key.expiry_time, NOW - 100);
        assert!(!key.inconsistent);
        assert!(f.panel.renews.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_batch_processes_soonest_expiry_first() {
        let f = fixture().await;
        f.ledger.credit(1, 1_000).await.unwrap();
        f.keys
            .create_key(1, "later", "nl-1", "a", NOW - 10, "vless://x")
            .await
            .unwrap();
        f.keys
            .create_key(1, "sooner", "nl-1", "b", NOW - 500, "vless://x")
            .await
            .unwrap();

        f.service.run_tick(NOW).await.unwrap();
        assert_eq!(*f.panel.renews.lock().unwrap(), vec!["sooner", "later"]);
    }

    #[tokio::test]
    async fn create_key_duplicate_email_is_unique_per_server() {
        // Registry-level guard backing the panel's duplicate check.
        let f = fixture().await;
        f.keys
            .create_key(1, "a", "nl-1", "phone", NOW, "vless://x")
            .await
            .unwrap();
        let err = f
            .keys
            .create_key(2, "b", "nl-1", "phone", NOW, "vless://y")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateLabel));
    }
}
