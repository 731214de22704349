pub mod alerts;
pub mod broadcast;
pub mod cache;
pub mod fetcher;
pub mod ledger;
pub mod notifier;
pub mod scheduler;
pub mod store;
