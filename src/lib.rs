pub mod app;
pub mod classifier;
pub mod cli;
pub mod commit;
pub mod config;
pub mod event;
pub mod live;
pub mod monitor;
pub mod notifier;
pub mod scanner;
pub mod selector;
pub mod tail;
pub mod usage;
pub mod util;
