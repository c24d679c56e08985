use crate::config::{
    Config, PAID_KEY_HOURS, RENEWAL_DAYS, RENEWAL_FEE, SERVER_CAPACITY, TRIAL_HOURS,
};
use crate::panel::{CreateCredential, PanelApi, PanelError};
use crate::services::lifecycle_service::{DAY_MS, HOUR_MS};
use anyhow::Result;
use helios_db::error::StoreError;
use helios_db::models::Key;
use helios_db::repositories::{KeyRepository, LedgerRepository};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_LABEL_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("trial key already used")]
    TrialUsed,

    #[error("balance below the fee")]
    InsufficientBalance,

    #[error("label already in use on this server")]
    DuplicateLabel,

    #[error("label is empty after sanitizing")]
    InvalidLabel,

    #[error("unknown server {0}")]
    UnknownServer(String),

    #[error("key not found")]
    KeyNotFound,

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for ProvisionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateLabel => ProvisionError::DuplicateLabel,
            StoreError::InsufficientBalance => ProvisionError::InsufficientBalance,
            other => ProvisionError::Other(other.into()),
        }
    }
}

/// Lowercases and strips a user-supplied key label down to
/// `[a-z0-9_-]`, truncated to 32 chars. The label doubles as the panel
/// email, which tolerates nothing fancier.
pub fn sanitize_label(raw: &str) -> Option<String> {
    let label: String = raw
        .trim()
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_LABEL_LEN)
        .collect();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

/// Key creation and on-demand renewal. The lifecycle scheduler owns the
/// automatic paths; this service covers everything a user triggers by
/// hand.
pub struct ProvisionService {
    keys: KeyRepository,
    ledger: LedgerRepository,
    panel: Arc<dyn PanelApi>,
    config: Arc<Config>,
}

impl ProvisionService {
    pub fn new(
        keys: KeyRepository,
        ledger: LedgerRepository,
        panel: Arc<dyn PanelApi>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            keys,
            ledger,
            panel,
            config,
        }
    }

    /// One free key per account, valid for a day plus grace.
    pub async fn create_trial_key(
        &self,
        now_ms: i64,
        tg_id: i64,
        server_id: &str,
        raw_label: &str,
    ) -> Result<Key, ProvisionError> {
        self.ledger.ensure_user(tg_id).await?;
        if self.ledger.trial_used(tg_id).await? {
            return Err(ProvisionError::TrialUsed);
        }

        let key = self
            .provision(now_ms, tg_id, server_id, raw_label, TRIAL_HOURS, 1)
            .await?;
        self.ledger.mark_trial_used(tg_id).await?;
        info!(tg_id, client_id = %key.client_id, "Trial key issued");
        Ok(key)
    }

    /// Debits the flat fee up front; any failure after that refunds it.
    pub async fn create_paid_key(
        &self,
        now_ms: i64,
        tg_id: i64,
        server_id: &str,
        raw_label: &str,
    ) -> Result<Key, ProvisionError> {
        self.ledger.ensure_user(tg_id).await?;
        self.ledger.debit(tg_id, RENEWAL_FEE).await?;

        match self
            .provision(now_ms, tg_id, server_id, raw_label, PAID_KEY_HOURS, 2)
            .await
        {
            Ok(key) => {
                info!(tg_id, client_id = %key.client_id, "Paid key issued");
                Ok(key)
            }
            Err(e) => {
                if let Err(refund) = self.ledger.credit(tg_id, RENEWAL_FEE).await {
                    error!(tg_id, "Refund after failed provisioning failed: {:#}", refund);
                }
                Err(e)
            }
        }
    }

    /// Panel first, registry second. If the registry insert loses a
    /// label race after the panel accepted the client, the fresh panel
    /// credential is rolled back.
    async fn provision(
        &self,
        now_ms: i64,
        tg_id: i64,
        server_id: &str,
        raw_label: &str,
        hours: i64,
        limit_ip: i64,
    ) -> Result<Key, ProvisionError> {
        let label = sanitize_label(raw_label).ok_or(ProvisionError::InvalidLabel)?;
        let server = self
            .config
            .server(server_id)
            .ok_or_else(|| ProvisionError::UnknownServer(server_id.to_string()))?;

        let client_id = Uuid::new_v4().to_string();
        let expiry_time = now_ms + hours * HOUR_MS;

        self.panel
            .create_credential(
                server,
                &CreateCredential {
                    client_id: client_id.clone(),
                    email: label.clone(),
                    tg_id,
                    expiry_time,
                    limit_ip,
                },
            )
            .await?;

        let uri = match self.panel.connection_uri(server, &client_id, &label).await {
            Ok(uri) => uri,
            Err(e) => {
                self.rollback_credential(server_id, &client_id).await;
                return Err(e.into());
            }
        };

        match self
            .keys
            .create_key(tg_id, &client_id, server_id, &label, expiry_time, &uri)
            .await
        {
            Ok(key) => Ok(key),
            Err(e) => {
                self.rollback_credential(server_id, &client_id).await;
                Err(e.into())
            }
        }
    }

    async fn rollback_credential(&self, server_id: &str, client_id: &str) {
        let Some(server) = self.config.server(server_id) else {
            return;
        };
        if let Err(e) = self.panel.delete_credential(server, client_id).await {
            warn!(client_id, "Rollback of panel credential failed: {}", e);
        }
    }

    /// User-triggered renewal from the warning keyboard. Same contract
    /// as the automatic path: debit, extend by a month from now, push to
    /// the panel, flag on divergence.
    pub async fn renew_key(
        &self,
        now_ms: i64,
        tg_id: i64,
        client_id: &str,
    ) -> Result<Key, ProvisionError> {
        let key = self
            .keys
            .get(client_id)
            .await
            .map_err(ProvisionError::Other)?
            .filter(|k| k.tg_id == tg_id)
            .ok_or(ProvisionError::KeyNotFound)?;
        // Server config first: failing after the debit or the extend
        // would leave money taken for nothing.
        let server = self
            .config
            .server(&key.server_id)
            .ok_or_else(|| ProvisionError::UnknownServer(key.server_id.clone()))?;

        self.ledger.debit(tg_id, RENEWAL_FEE).await?;

        let new_expiry = now_ms + RENEWAL_DAYS * DAY_MS;
        self.keys
            .extend_key(client_id, new_expiry)
            .await
            .map_err(ProvisionError::Other)?;
        if let Err(e) = self
            .panel
            .renew_credential(server, tg_id, client_id, &key.email, new_expiry)
            .await
        {
            error!(client_id, "Panel renew failed: {}", e);
            self.keys
                .mark_inconsistent(client_id)
                .await
                .map_err(ProvisionError::Other)?;
            return Err(e.into());
        }

        info!(tg_id, client_id, "Key renewed on request");
        self.keys
            .get(client_id)
            .await
            .map_err(ProvisionError::Other)?
            .ok_or(ProvisionError::KeyNotFound)
    }

    /// Fill percentage per server, for the server-picker keyboard.
    pub async fn server_fill(&self) -> Result<Vec<(String, String, i64)>> {
        let mut fill = Vec::with_capacity(self.config.servers.len());
        for (id, server) in &self.config.servers {
            let count = self.keys.count_on_server(id).await?;
            let pct = (count * 100 / SERVER_CAPACITY).min(100);
            fill.push((id.clone(), server.name.clone(), pct));
        }
        fill.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockPanel {
        created: Mutex<Vec<CreateCredential>>,
        deleted: Mutex<Vec<String>>,
        renewed: Mutex<Vec<String>>,
        duplicate_email: bool,
        fail_renew: bool,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl PanelApi for MockPanel {
        async fn create_credential(
            &self,
            _server: &ServerConfig,
            credential: &CreateCredential,
        ) -> Result<(), PanelError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.duplicate_email {
                return Err(PanelError::DuplicateEmail);
            }
            self.created.lock().unwrap().push(credential.clone());
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
            self.renewed.lock().unwrap().push(client_id.to_string());
            if self.fail_renew {
                return Err(PanelError::Api("refused".into()));
            }
            Ok(())
        }

        async fn delete_credential(
            &self,
            _server: &ServerConfig,
            client_id: &str,
        ) -> Result<(), PanelError> {
            self.deleted.lock().unwrap().push(client_id.to_string());
            Ok(())
        }

        async fn connection_uri(
            &self,
            _server: &ServerConfig,
            client_id: &str,
            _email: &str,
        ) -> Result<String, PanelError> {
            Ok(format!("vless://{}", client_id))
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
        service: ProvisionService,
    }

    async fn fixture_with(panel: MockPanel) -> Fixture {
        let pool = helios_db::connect_memory().await.unwrap();
        let keys = KeyRepository::new(pool.clone());
        let ledger = LedgerRepository::new(pool);
        let panel = Arc::new(panel);
        let service = ProvisionService::new(
            keys.clone(),
            ledger.clone(),
            panel.clone(),
            test_config(),
        );
        Fixture {
            keys,
            ledger,
            panel,
            service,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(MockPanel::default()).await
    }

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn labels_are_sanitized() {
        assert_eq!(sanitize_label("  My Phone! "), Some("myphone".into()));
        assert_eq!(sanitize_label("work_laptop-2"), Some("work_laptop-2".into()));
        assert_eq!(sanitize_label("!!!"), None);
        let long = "a".repeat(50);
        assert_eq!(sanitize_label(&long).unwrap().len(), MAX_LABEL_LEN);
    }

    #[tokio::test]
    async fn trial_key_is_issued_once() {
        let f = fixture().await;
        let key = f
            .service
            .create_trial_key(NOW, 42, "nl-1", "phone")
            .await
            .unwrap();
        assert_eq!(key.expiry_time, NOW + TRIAL_HOURS * HOUR_MS);
        assert_eq!(key.email, "phone");

        let err = f
            .service
            .create_trial_key(NOW, 42, "nl-1", "tablet")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::TrialUsed));
        assert_eq!(f.panel.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn paid_key_debits_the_fee() {
        let f = fixture().await;
        f.ledger.credit(42, 250).await.unwrap();

        let key = f
            .service
            .create_paid_key(NOW, 42, "nl-1", "phone")
            .await
            .unwrap();
        assert_eq!(key.expiry_time, NOW + PAID_KEY_HOURS * HOUR_MS);
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 150);

        let created = f.panel.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].email, "phone");
        assert_eq!(created[0].limit_ip, 2);
    }

    #[tokio::test]
    async fn paid_key_without_funds_never_reaches_the_panel() {
        let f = fixture().await;
        f.ledger.credit(42, 50).await.unwrap();

        let err = f
            .service
            .create_paid_key(NOW, 42, "nl-1", "phone")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InsufficientBalance));
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 50);
        assert_eq!(f.panel.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_label_refunds_the_fee() {
        let panel = MockPanel {
            duplicate_email: true,
            ..Default::default()
        };
        let f = fixture_with(panel).await;
        f.ledger.credit(42, 100).await.unwrap();

        let err = f
            .service
            .create_paid_key(NOW, 42, "nl-1", "phone")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Panel(PanelError::DuplicateEmail)));
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn registry_label_race_rolls_the_panel_credential_back() {
        let f = fixture().await;
        f.ledger.credit(42, 200).await.unwrap();
        // Same label already registered by another account.
        f.keys
            .create_key(7, "other", "nl-1", "phone", NOW, "vless://x")
            .await
            .unwrap();

        let err = f
            .service
            .create_paid_key(NOW, 42, "nl-1", "phone")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DuplicateLabel));
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 200);
        assert_eq!(f.panel.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_renew_extends_and_debits() {
        let f = fixture().await;
        f.ledger.credit(42, 150).await.unwrap();
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW + HOUR_MS, "vless://x")
            .await
            .unwrap();

        let key = f.service.renew_key(NOW, 42, "k1").await.unwrap();
        assert_eq!(key.expiry_time, NOW + RENEWAL_DAYS * DAY_MS);
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 50);
        assert_eq!(*f.panel.renewed.lock().unwrap(), vec!["k1"]);
    }

    #[tokio::test]
    async fn renewing_someone_elses_key_is_refused() {
        let f = fixture().await;
        f.ledger.credit(42, 150).await.unwrap();
        f.keys
            .create_key(7, "k1", "nl-1", "phone", NOW + HOUR_MS, "vless://x")
            .await
            .unwrap();

        let err = f.service.renew_key(NOW, 42, "k1").await.unwrap_err();
        assert!(matches!(err, ProvisionError::KeyNotFound));
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn manual_renew_on_unknown_server_charges_nothing() {
        let f = fixture().await;
        f.ledger.credit(42, 150).await.unwrap();
        f.keys
            .create_key(42, "k1", "ghost", "phone", NOW + HOUR_MS, "vless://x")
            .await
            .unwrap();

        let err = f.service.renew_key(NOW, 42, "k1").await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownServer(_)));
        assert_eq!(f.ledger.get_balance(42).await.unwrap(), 150);
        let key = f.keys.get("k1").await.unwrap().unwrap();
        assert_eq!(key.expiry_time, NOW + HOUR_MS);
    }

    #[tokio::test]
    async fn manual_renew_panel_failure_flags_the_key() {
        let panel = MockPanel {
            fail_renew: true,
            ..Default::default()
        };
        let f = fixture_with(panel).await;
        f.ledger.credit(42, 150).await.unwrap();
        f.keys
            .create_key(42, "k1", "nl-1", "phone", NOW + HOUR_MS, "vless://x")
            .await
            .unwrap();

        let err = f.service.renew_key(NOW, 42, "k1").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Panel(_)));
        let key = f.keys.get("k1").await.unwrap().unwrap();
        assert!(key.inconsistent);
        assert_eq!(key.expiry_time, NOW + RENEWAL_DAYS * DAY_MS);
    }

    #[tokio::test]
    async fn server_fill_is_a_capped_percentage() {
        let f = fixture().await;
        for i in 0..30 {
            f.keys
                .create_key(i, &format!("k{}", i), "nl-1", &format!("d{}", i), NOW, "u")
                .await
                .unwrap();
        }
        let fill = f.service.server_fill().await.unwrap();
        assert_eq!(fill, vec![("nl-1".into(), "Netherlands 1".into(), 50)]);
    }
}
