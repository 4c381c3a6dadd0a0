pub mod debug;
pub mod error;
pub mod protocol;
pub mod settings;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{Error, Result};
pub use rmongo_core::buf::{BufferPool, ByteBuf, CompositeBuf};
pub use rmongo_wire::MessageSettings;
