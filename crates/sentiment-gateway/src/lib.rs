pub mod accounts;
pub mod app;
pub mod configuration;
pub mod db;
pub mod handler;
pub mod inference;
pub mod ledger;
pub mod metric;
pub mod server;
pub mod store;
pub mod videos;
