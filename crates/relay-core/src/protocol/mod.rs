//! Protocol module containing frame types, the JSON codec, and sequencing.

pub mod codec;
pub mod frame;
pub mod sequence;

pub use codec::{decode_frame, encode_frame, ProtocolError, MAX_FRAME_BYTES, MAX_PROMPT_BYTES};
pub use frame::*;
pub use sequence::SequenceCounter;
