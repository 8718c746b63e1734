pub mod store;

pub use store::{create_event, PgEventStore, SCHEMA};
