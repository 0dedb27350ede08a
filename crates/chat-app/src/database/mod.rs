mod persistence;

pub use persistence::{CHATS_KEY, PersistenceError, PersistenceGateway, PersistenceResult};
