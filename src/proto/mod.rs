//! Wire protocol: the typed reply tree and the streaming codec.

mod decoder;
mod encoder;
mod frame;

pub use decoder::Decoder;
pub use encoder::{encode_command, Encoder};
pub use frame::Reply;
