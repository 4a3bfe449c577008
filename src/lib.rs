//! A USB/IP server that exports virtual USB devices over TCP.
//!
//! A USB/IP client attaches to [`Server`] and drives the exported
//! [`device::VirtualUsbDevice`] exactly as if it were plugged in
//! locally: the session state machine in [`session`] handles
//! enumeration and attach, the codec in [`usbip`] frames the wire
//! protocol, and [`control`] answers standard device requests from the
//! descriptor tree built with [`usb::builder`].

pub mod control;
pub mod device;
pub mod error;
pub mod server;
pub mod session;
pub mod usb;
pub mod usbip;

pub use device::{DataHandler, ReplySink, UrbRequest, VirtualUsbDevice};
pub use error::{Result, UsbIpError};
pub use server::Server;
