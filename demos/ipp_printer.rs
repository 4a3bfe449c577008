//! Example [`DataHandler`]: bridges a virtual IPP-over-USB printer's
//! bulk endpoints to a real upstream IPP server over TCP, and answers
//! the printer class requests a host expects from an IPP-over-USB
//! device (`GET_DEVICE_ID`, port status, soft reset).
//!
//! Grounded in `ipp_printer.py`'s `IPPOverUSBDevice`: bulk OUT forwards
//! the host's write to the upstream server and opportunistically picks
//! up an immediate reply; bulk IN drains that stash before trying a
//! fresh read from the upstream connection. This lives outside the
//! core crate's public test surface — it is one concrete collaborator
//! a user of the library might write, not part of the protocol core.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

use usbip_server::device::{DataHandler, ReplySink, UrbRequest, VirtualUsbDevice};
use usbip_server::server::{Server, DEFAULT_PORT};
use usbip_server::usb::{
    ConfigurationBuilder, Direction, EndpointBuilder, InterfaceBuilder, SynchronizationType,
    TransferType, UsageType, VirtualUsbDeviceBuilder,
};
use usbip_server::usbip::Direction as UrbDirection;

const GET_DEVICE_ID: u8 = 0x01;
const GET_PORT_STATUS: u8 = 0x02;
const SOFT_RESET: u8 = 0x02;
const CLASS_DEVICE_TO_HOST: u8 = 0xa1;
const CLASS_HOST_TO_DEVICE: u8 = 0x21;

const BULK_OUT_EP: u32 = 1;
const BULK_IN_EP: u32 = 2;

const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_POLL_TIMEOUT: Duration = Duration::from_millis(100);

struct UpstreamState {
    stream: Option<TcpStream>,
    pending_response: Vec<u8>,
}

/// Forwards bulk traffic to an upstream IPP server. One instance is
/// shared across every session the device is attached to; the upstream
/// connection itself is guarded by a mutex since only one session at a
/// time may be attached to this device, but bulk OUT and bulk IN can
/// still race within that session.
pub struct IppPrinterHandler {
    upstream_addr: String,
    manufacturer: String,
    product: String,
    state: Mutex<UpstreamState>,
}

impl IppPrinterHandler {
    pub fn new(
        upstream_addr: impl Into<String>,
        manufacturer: impl Into<String>,
        product: impl Into<String>,
    ) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            manufacturer: manufacturer.into(),
            product: product.into(),
            state: Mutex::new(UpstreamState {
                stream: None,
                pending_response: Vec::new(),
            }),
        }
    }

    fn ensure_connected(&self, state: &mut UpstreamState) -> bool {
        if state.stream.is_some() {
            return true;
        }
        match TcpStream::connect(&self.upstream_addr) {
            Ok(stream) => {
                if let Err(e) = stream.set_read_timeout(Some(UPSTREAM_IDLE_TIMEOUT)) {
                    warn!("failed to set upstream read timeout: {e}");
                }
                state.stream = Some(stream);
                true
            }
            Err(e) => {
                warn!(
                    "failed to connect to upstream IPP server {}: {e}",
                    self.upstream_addr
                );
                false
            }
        }
    }

    fn handle_bulk_out(&self, request: &UrbRequest, sink: &mut dyn ReplySink) {
        if request.payload.is_empty() {
            sink.send(0, &[]);
            return;
        }

        let mut state = self.state.lock().unwrap();
        if !self.ensure_connected(&mut state) {
            sink.send(1, &[]);
            return;
        }

        if let Err(e) = state.stream.as_mut().unwrap().write_all(request.payload) {
            warn!("failed forwarding to upstream IPP server: {e}");
            state.stream = None;
            sink.send(1, &[]);
            return;
        }
        debug!(
            "forwarded {} bytes to upstream IPP server",
            request.payload.len()
        );

        // Opportunistically pick up an immediate reply, same as the
        // short non-blocking recv the original performs right after
        // the send.
        if let Some(stream) = state.stream.as_mut() {
            let _ = stream.set_read_timeout(Some(UPSTREAM_POLL_TIMEOUT));
            let mut buf = [0u8; 8192];
            if let Ok(n) = stream.read(&mut buf) {
                if n > 0 {
                    state.pending_response.extend_from_slice(&buf[..n]);
                }
            }
            let _ = stream.set_read_timeout(Some(UPSTREAM_IDLE_TIMEOUT));
        }

        sink.send(0, &[]);
    }

    fn handle_bulk_in(&self, request: &UrbRequest, sink: &mut dyn ReplySink) {
        let max_len = request.cmd.transfer_buffer_length as usize;
        let mut state = self.state.lock().unwrap();

        if !state.pending_response.is_empty() {
            let take = max_len.min(state.pending_response.len());
            let data: Vec<u8> = state.pending_response.drain(..take).collect();
            debug!("sending {} buffered bytes to host", data.len());
            sink.send(0, &data);
            return;
        }

        let Some(stream) = state.stream.as_mut() else {
            sink.send(0, &[]);
            return;
        };

        let _ = stream.set_read_timeout(Some(UPSTREAM_POLL_TIMEOUT));
        let mut buf = vec![0u8; max_len.max(1)];
        let result = stream.read(&mut buf);
        let _ = stream.set_read_timeout(Some(UPSTREAM_IDLE_TIMEOUT));

        match result {
            Ok(0) | Err(_) => sink.send(0, &[]),
            Ok(n) => {
                debug!("received {n} bytes from upstream IPP server");
                sink.send(0, &buf[..n]);
            }
        }
    }

    fn handle_class_control(&self, request: &UrbRequest, sink: &mut dyn ReplySink) {
        use packed_struct::prelude::*;
        use usbip_server::usb::SetupRequest;

        let setup = match SetupRequest::unpack(&request.cmd.setup) {
            Ok(setup) => setup,
            Err(_) => {
                sink.send(1, &[]);
                return;
            }
        };
        let w_length = setup.w_length.to_primitive() as usize;

        match (setup.bm_request_type, setup.b_request) {
            (CLASS_DEVICE_TO_HOST, GET_DEVICE_ID) => {
                let device_id = format!(
                    "MFG:{};CMD:PostScript,PDF;MDL:{};CLS:PRINTER;",
                    self.manufacturer, self.product
                );
                let id_bytes = device_id.as_bytes();
                let mut response = (id_bytes.len() as u16).to_be_bytes().to_vec();
                response.extend_from_slice(id_bytes);
                let len = response.len().min(w_length);
                sink.send(0, &response[..len]);
            }
            (CLASS_DEVICE_TO_HOST, GET_PORT_STATUS) => {
                sink.send(0, &[0x18][..w_length.min(1)]);
            }
            (CLASS_HOST_TO_DEVICE, SOFT_RESET) => {
                debug!("printer soft reset requested");
                sink.send(0, &[]);
            }
            (req_type, request_code) => {
                debug!("unhandled control request: {req_type:#04x} {request_code:#04x}");
                sink.send(1, &[]);
            }
        }
    }
}

impl DataHandler for IppPrinterHandler {
    fn handle_urb_data(&self, request: &UrbRequest, sink: &mut dyn ReplySink) {
        if request.ep() == 0 {
            self.handle_class_control(request, sink);
        } else if request.cmd.direction() == UrbDirection::Out {
            self.handle_bulk_out(request, sink);
        } else {
            self.handle_bulk_in(request, sink);
        }
    }
}

fn main() {
    use simple_logger::SimpleLogger;
    SimpleLogger::new().init().unwrap();

    let upstream = std::env::var("IPP_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:631".to_string());
    let manufacturer = "Virtual".to_string();
    let product = "IPP-USB Proxy".to_string();

    let info = VirtualUsbDeviceBuilder::new(0x03f0, 0x1234)
        .class(usbip_server::usb::DeviceClass::PrinterOrImaging)
        .manufacturer(&manufacturer)
        .product(&product)
        .serial_number("VIP001")
        .add_configuration(
            ConfigurationBuilder::new(1).max_power_ma(100).add_interface(
                InterfaceBuilder::new(0)
                    .class(usbip_server::usb::DeviceClass::PrinterOrImaging)
                    .sub_class(0x01)
                    .protocol(0x02)
                    .add_endpoint(
                        EndpointBuilder::new(BULK_OUT_EP as u8, Direction::Out, TransferType::Bulk)
                            .synchronization(SynchronizationType::NoSynchronization)
                            .usage(UsageType::Data)
                            .max_packet_size(0x0200),
                    )
                    .add_endpoint(
                        EndpointBuilder::new(BULK_IN_EP as u8, Direction::In, TransferType::Bulk)
                            .max_packet_size(0x0200),
                    ),
            ),
        )
        .build();

    let handler = std::sync::Arc::new(IppPrinterHandler::new(upstream, manufacturer, product));
    let device = VirtualUsbDevice::new(
        info,
        "/sys/devices/pci0000:00/0000:00:01.2/usb1/1-1",
        "1-1",
    )
    .with_data_handler(handler);

    let server = Server::bind(("0.0.0.0", DEFAULT_PORT), vec![device])
        .expect("failed to bind USB/IP listen address");
    log::info!("ipp-over-usb demo listening on {:?}", server.local_addr());

    if let Err(e) = server.run() {
        log::error!("server stopped: {e}");
    }
}
