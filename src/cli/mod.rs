pub mod app;
pub mod browser_args;
pub mod commands;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod env;
pub mod info;
pub mod output;
pub mod render;
pub mod runtime;
pub mod sign;

