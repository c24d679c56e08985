pub mod backup_service;
pub mod broadcast_service;
pub mod lifecycle_service;
pub mod provision_service;
pub mod referral_service;

pub use backup_service::BackupService;
pub use broadcast_service::BroadcastService;
pub use lifecycle_service::LifecycleService;
pub use provision_service::{ProvisionError, ProvisionService};
pub use referral_service::ReferralService;
