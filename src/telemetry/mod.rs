pub mod connection;
pub mod publisher;

pub use connection::connect;
pub use publisher::{PublishOutcome, Publisher, TelemetrySink};
