//! TCP reassembly (spec §4.4): sequence-number arithmetic, per-direction
//! reorder buffers, per-connection state, and the per-lane state machine
//! that ties them together.

pub mod assembler;
pub mod halfstream;
pub mod seq;
pub mod stream;

pub use assembler::Lane;
pub use stream::Tuple4;
