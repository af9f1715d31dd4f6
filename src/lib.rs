pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod http;
pub mod notifications;
pub mod output;
pub mod service;
pub mod subscriptions;
