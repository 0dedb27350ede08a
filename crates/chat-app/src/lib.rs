pub mod app;
pub mod chat;
pub mod database;
pub mod settings;

pub use app::{ChatApp, ChatSummary};
