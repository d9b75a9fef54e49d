pub mod archive;
pub mod command;
pub mod config;
pub mod database;
pub mod files;
pub mod permissions;
pub mod pipeline;
pub mod prefix;
pub mod remote;
pub mod rewrite;
pub mod runtime;
pub mod wp_cli;
