pub mod decoder;
pub mod reader;

pub use decoder::{decode, resolve_all};
pub use reader::{FrameReader, SerialTransport, TtyTransport};
