pub mod chat;
pub mod config;
pub mod db;
pub mod detector;
pub mod feed;
pub mod model;
pub mod notifier;
pub mod outbox;
pub mod registry;
pub mod store;
pub mod sweep;
