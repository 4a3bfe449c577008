//! The virtual USB device: descriptor tree, identity, and URB routing.
//!
//! A device holds no socket and no session state — it is immutable
//! read-mostly shared state, looked up by the session and handed a URB
//! plus a reply sink. This replaces the teacher's pattern of attaching
//! the live connection to the device object itself, which made the
//! device stateful and unshareable across sessions.

use std::sync::Arc;

use crate::control;
use crate::usb::Info;
use crate::usbip::{CmdSubmit, DeviceInfo, InterfaceInfo};

/// A URB addressed to a non-control endpoint, handed to a
/// [`DataHandler`].
pub struct UrbRequest<'a> {
    pub cmd: &'a CmdSubmit,
    pub payload: &'a [u8],
}

impl<'a> UrbRequest<'a> {
    pub fn ep(&self) -> u32 {
        self.cmd.header.ep
    }
}

/// A write-only handle that accepts exactly one reply per URB. Owned by
/// the session for the duration of a single `handle_urb` call and
/// dropped afterwards — a concrete [`DataHandler`] never holds on to
/// one past the call that gave it one.
pub trait ReplySink {
    /// Emits the `RET_SUBMIT` for the URB this sink was created for.
    /// `status == 0` means success; any other value is interpreted by
    /// the client as a stall. Calling this more than once on the same
    /// sink is a logic error; implementations only honor the first
    /// call.
    fn send(&mut self, status: i32, payload: &[u8]);
}

/// Per-device hook for traffic on endpoints other than 0. The default
/// (no handler configured) replies with zero-length success, matching
/// the permissive behaviour of the control handler's fallback case.
pub trait DataHandler: Send + Sync {
    fn handle_urb_data(&self, request: &UrbRequest, sink: &mut dyn ReplySink);
}

/// The default data handler: replies to everything with empty success.
/// Used both for endpoints the concrete device doesn't care about and,
/// via [`crate::control::handle`], for class/vendor control requests
/// when no concrete handler is configured.
pub(crate) struct EmptySuccessHandler;

impl DataHandler for EmptySuccessHandler {
    fn handle_urb_data(&self, _request: &UrbRequest, sink: &mut dyn ReplySink) {
        sink.send(0, &[]);
    }
}

/// A virtual USB device: its fabricated descriptor tree, the identity
/// fields a USB/IP client needs for enumeration and attach, and an
/// optional data handler for non-control traffic.
pub struct VirtualUsbDevice {
    pub info: Info,
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    data_handler: Arc<dyn DataHandler>,
}

impl VirtualUsbDevice {
    pub fn new(info: Info, path: impl Into<String>, busid: impl Into<String>) -> Self {
        Self {
            info,
            path: path.into(),
            busid: busid.into(),
            busnum: 1,
            devnum: 2,
            speed: 2,
            data_handler: Arc::new(EmptySuccessHandler),
        }
    }

    pub fn with_data_handler(mut self, handler: Arc<dyn DataHandler>) -> Self {
        self.data_handler = handler;
        self
    }

    fn configuration_value(&self) -> u8 {
        self.info
            .configs
            .first()
            .map(|c| c.descriptor.b_configuration_value)
            .unwrap_or(0)
    }

    fn num_interfaces(&self) -> u8 {
        self.info
            .configs
            .first()
            .map(|c| c.interfaces.len() as u8)
            .unwrap_or(0)
    }

    fn base_device_info(&self) -> DeviceInfo {
        let mut dev_info = DeviceInfo::new(&self.path, &self.busid);
        dev_info.busnum = self.busnum;
        dev_info.devnum = self.devnum;
        dev_info.speed = self.speed;
        dev_info.id_vendor = self.info.device_desc.id_vendor.to_primitive();
        dev_info.id_product = self.info.device_desc.id_product.to_primitive();
        dev_info.bcd_device = self.info.device_desc.bcd_device.to_primitive();
        dev_info.b_device_class = self.info.device_desc.b_device_class;
        dev_info.b_device_sub_class = self.info.device_desc.b_device_sub_class;
        dev_info.b_device_protocol = self.info.device_desc.b_device_protocol;
        dev_info.b_configuration_value = self.configuration_value();
        dev_info.b_num_configurations = self.info.device_desc.b_num_configurations;
        dev_info.b_num_interfaces = self.num_interfaces();
        dev_info
    }

    /// The `DeviceInfo` plus one `InterfaceInfo` per interface of the
    /// first configuration, as required in an `OP_REP_DEVLIST` entry.
    pub fn describe_for_devlist(&self) -> (DeviceInfo, Vec<InterfaceInfo>) {
        let dev_info = self.base_device_info();
        let interfaces = self
            .info
            .configs
            .first()
            .map(|c| {
                c.interfaces
                    .iter()
                    .map(|iface| {
                        InterfaceInfo::new(
                            iface.descriptor.b_interface_class,
                            iface.descriptor.b_interface_sub_class,
                            iface.descriptor.b_interface_protocol,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        (dev_info, interfaces)
    }

    /// Just the `DeviceInfo`, as carried (without trailing interfaces)
    /// in an `OP_REP_IMPORT` reply.
    pub fn describe_for_import(&self) -> DeviceInfo {
        self.base_device_info()
    }

    /// Routes a URB to the control handler (`ep == 0`) or the
    /// configured data handler (everything else), guaranteeing exactly
    /// one reply is sent through `sink`.
    pub fn handle_urb(&self, cmd: &CmdSubmit, payload: &[u8], sink: &mut dyn ReplySink) {
        if cmd.header.ep == 0 {
            control::handle(&self.info, cmd, payload, self.data_handler.as_ref(), sink);
        } else {
            let request = UrbRequest { cmd, payload };
            self.data_handler.handle_urb_data(&request, sink);
        }
    }
}
