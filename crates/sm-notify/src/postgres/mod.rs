//! Postgres-backed collaborators for the notificator

mod connection;
mod storage;

pub use connection::{PgConnectionFactory, PgNotificationConnection};
pub use storage::PgNotificationStorage;
