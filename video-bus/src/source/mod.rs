//! Sources produce a publisher of encoded packets: codec parameters first,
//! then encoded frames.

mod av;
mod bus;

pub use av::{av_source, AvInput};
pub use bus::{bus_source, control_source};
