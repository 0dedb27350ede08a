pub mod state;

pub use state::{AppSettings, EDITABLE_SETTINGS, SettingsError, SettingsStore};
