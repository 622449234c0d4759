pub mod config;
pub mod engine;
pub mod images;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod reaper;
pub mod rows;
pub mod site;
pub mod sql;
pub mod tls;
pub mod validate;
pub mod wal;
pub mod wire;
