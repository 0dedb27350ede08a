use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("failed to create store directory at {path:?}"))]
    CreateStoreDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read store from {path:?}"))]
    ReadStore {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("store at {path:?} is not valid JSON: {source}"))]
    ParseStore {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("store at {path:?} does not hold a JSON object"))]
    NotAnObject { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to serialize store document on `{stage}`: {source}"))]
    SerializeStore {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write store to {path:?}"))]
    WriteStore {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace store file from {from:?} to {to:?}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("store lock was poisoned on `{stage}`"))]
    LockPoisoned { stage: &'static str },
}

pub type StorageResult<T> = Result<T, StorageError>;
