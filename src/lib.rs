pub mod config;
pub mod dag;
pub mod errors;
pub mod escalation;
pub mod gates;
pub mod init;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod ownership;
pub mod stagehand_config;
pub mod ui;
pub mod unit;
pub mod verification;
