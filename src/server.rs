//! Accept loop: binds a TCP listener and runs one [`Session`] per
//! accepted connection on its own thread, mirroring the teacher's own
//! thread-per-worker concurrency (`ReadHandler`/`WriteHandler` in
//! `virtual_usb.rs`, each spawned on `thread::spawn`).

use std::net::{TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use log::{info, warn};

use crate::device::VirtualUsbDevice;
use crate::error::{Result, UsbIpError};
use crate::session::Session;

/// Default USB/IP listen port.
pub const DEFAULT_PORT: u16 = 3240;

/// Owns the read-only list of exported devices and the listening
/// socket.
pub struct Server {
    listener: TcpListener,
    devices: Arc<[VirtualUsbDevice]>,
}

impl Server {
    /// Binds `addr` and exports `devices` to every client that
    /// connects. `TcpListener::bind` already sets `SO_REUSEADDR` on
    /// Unix and uses the platform's default backlog, which is at least
    /// 5 on every target this server runs on.
    pub fn bind(addr: impl ToSocketAddrs, devices: Vec<VirtualUsbDevice>) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(UsbIpError::Io)?;
        Ok(Self {
            listener,
            devices: Arc::from(devices),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(UsbIpError::Io)
    }

    /// Accepts connections forever, running each session on its own
    /// thread. Never returns unless `accept` itself fails fatally.
    pub fn run(&self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().map_err(UsbIpError::Io)?;
            info!("accepted connection from {peer}");

            let devices = self.devices.clone();
            thread::spawn(move || {
                let mut session = match Session::new(stream, devices) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!("failed to configure session for {peer}: {e}");
                        return;
                    }
                };
                session.run();
                info!("session with {peer} ended");
            });
        }
    }
}
