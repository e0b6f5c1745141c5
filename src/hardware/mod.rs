//! Hardware plumbing shared by every instrument.
//!
//! Transports, bounded polling reads and the caller-facing capability traits.

pub mod capabilities;
pub mod polling;
pub mod transport;

pub use capabilities::{Readback, Spectrometer};
pub use polling::{read_frame, send_command, Link, PollSchedule};
pub use transport::{
    device_connector, drain, DatagramConnector, DatagramLink, DynDatagram, DynSerial, Preconnected,
    PreconnectedDatagram, SerialPortIO, StreamConnector, TcpConnector, UdpConnector,
};

#[cfg(feature = "tokio_serial")]
pub use transport::SerialConnector;
