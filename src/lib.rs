pub mod cli;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod exit;
pub mod fleet;
pub mod locator;
pub mod logs;
pub mod mitigation;
pub mod platform;
pub mod report;
pub mod topology;
pub mod ui;
