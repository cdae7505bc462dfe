pub mod recorder;

pub use recorder::{CsvStore, DurableStore, Recorder};
