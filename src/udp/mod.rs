//! UDP over a stream channel
//!
//! Many local UDP flows share one channel as a sequence of records tagged
//! with each flow's source address. [`UdpEgress`] is the forwarder side;
//! [`CircuitMux`] is the dialing side, one virtual circuit per source.

mod circuit;
mod egress;
mod record;

pub use circuit::{CircuitMux, CircuitTable};
pub use egress::UdpEgress;
pub use record::{Record, RecordCodec, RecordError, RECORD_VERSION};
