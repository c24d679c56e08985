pub mod key_repo;
pub mod ledger_repo;
pub mod referral_repo;

pub use key_repo::KeyRepository;
pub use ledger_repo::LedgerRepository;
pub use referral_repo::ReferralRepository;
