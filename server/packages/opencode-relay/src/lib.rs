pub mod access;
pub mod bot;
pub mod cli;
pub mod commands;
pub mod prompt;
pub mod render;
pub mod store;
pub mod telegram;
