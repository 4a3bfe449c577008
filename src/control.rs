//! Control-transfer dispatcher: decodes the SETUP packet carried by a
//! `CMD_SUBMIT` on endpoint 0 and answers it from the device's
//! descriptor tree.
//!
//! Deliberately permissive: anything this table doesn't recognise gets
//! an empty, successful reply rather than a stall, because real USB
//! drivers probe speculatively with requests the device doesn't care
//! about and a stall there would abort enumeration.

use log::debug;
use packed_struct::prelude::*;

use crate::device::{DataHandler, ReplySink, UrbRequest};
use crate::usb::{DescriptorType, Info, SetupRequest, StandardRequest, Type};
use crate::usbip::CmdSubmit;

/// English (United States) LANGID string descriptor, the fixed reply to
/// any `GET_DESCRIPTOR(STRING, *)` request regardless of index.
const LANGID_ENGLISH_US: [u8; 4] = [0x04, 0x03, 0x09, 0x04];

/// `GET_STATUS` reply: self-powered, no remote wakeup.
const DEVICE_STATUS: [u8; 2] = [0x01, 0x00];

pub fn handle(
    info: &Info,
    cmd: &CmdSubmit,
    payload: &[u8],
    data_handler: &dyn DataHandler,
    sink: &mut dyn ReplySink,
) {
    let setup = match SetupRequest::unpack(&cmd.setup) {
        Ok(setup) => setup,
        Err(err) => {
            debug!("malformed SETUP packet: {err}; empty success");
            sink.send(0, &[]);
            return;
        }
    };
    let w_length = setup.w_length.to_primitive() as usize;

    match setup.request_type() {
        Type::Standard => {
            match setup.standard_request() {
                Some(StandardRequest::GetDescriptor) => {
                    handle_get_descriptor(info, &setup, w_length, sink);
                }
                Some(StandardRequest::GetStatus) => {
                    sink.send(0, truncate(&DEVICE_STATUS, w_length));
                }
                Some(StandardRequest::SetConfiguration) => {
                    sink.send(0, &[]);
                }
                other => {
                    debug!("unhandled standard request {other:?}; empty success");
                    sink.send(0, &[]);
                }
            }
        }
        Type::Class | Type::Vendor => {
            // Delegated to the device-specific hook; the default hook
            // (no concrete device handler configured) already replies
            // with empty success, matching the fallback in the table.
            let request = UrbRequest { cmd, payload };
            data_handler.handle_urb_data(&request, sink);
        }
        Type::Reserved => {
            debug!("reserved request type; empty success");
            sink.send(0, &[]);
        }
    }
}

fn handle_get_descriptor(info: &Info, setup: &SetupRequest, w_length: usize, sink: &mut dyn ReplySink) {
    match setup.descriptor_type() {
        Some(DescriptorType::Device) => {
            let bytes = info.device_desc.pack().expect("fixed-size struct always packs");
            sink.send(0, truncate(&bytes, w_length));
        }
        Some(DescriptorType::Configuration) => match info.configs.first() {
            Some(config) => {
                let bytes = config.clone().serialize();
                sink.send(0, truncate(&bytes, w_length));
            }
            None => sink.send(0, &[]),
        },
        Some(DescriptorType::String) => {
            sink.send(0, truncate(&LANGID_ENGLISH_US, w_length));
        }
        other => {
            debug!("GET_DESCRIPTOR for unsupported type {other:?}; empty success");
            sink.send(0, &[]);
        }
    }
}

fn truncate(bytes: &[u8], w_length: usize) -> &[u8] {
    &bytes[..bytes.len().min(w_length)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{ConfigurationBuilder, VirtualUsbDeviceBuilder};
    use crate::usbip::{CommandHeader, Direction, USBIP_CMD_SUBMIT};

    struct RecordingSink {
        status: Option<i32>,
        payload: Vec<u8>,
    }

    impl ReplySink for RecordingSink {
        fn send(&mut self, status: i32, payload: &[u8]) {
            if self.status.is_some() {
                return;
            }
            self.status = Some(status);
            self.payload = payload.to_vec();
        }
    }

    fn submit_with_setup(setup: [u8; 8]) -> CmdSubmit {
        CmdSubmit {
            header: CommandHeader {
                command: USBIP_CMD_SUBMIT,
                seqnum: 1,
                devid: 1,
                direction: Direction::In as u32,
                ep: 0,
            },
            transfer_flags: 0,
            transfer_buffer_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup,
        }
    }

    fn recv(info: &Info, setup: [u8; 8]) -> (i32, Vec<u8>) {
        let cmd = submit_with_setup(setup);
        let mut sink = RecordingSink {
            status: None,
            payload: Vec::new(),
        };
        let data_handler = crate::device::EmptySuccessHandler;
        handle(info, &cmd, &[], &data_handler, &mut sink);
        (sink.status.unwrap(), sink.payload)
    }

    #[test]
    fn get_descriptor_device_truncates_to_wlength() {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001).build();
        // E4: wValue=0x0100 (DEVICE, idx 0), wLength=0x0012
        let (status, payload) = recv(&info, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(status, 0);
        assert_eq!(payload.len(), 18);
    }

    #[test]
    fn get_descriptor_configuration_short_probe_returns_header_only() {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001)
            .add_configuration(ConfigurationBuilder::new(1))
            .build();
        // E5: wValue=0x0200, wLength=9
        let (status, payload) = recv(&info, [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x00]);
        assert_eq!(status, 0);
        assert_eq!(payload.len(), 9);
    }

    #[test]
    fn get_descriptor_string_returns_langid_table() {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001).build();
        let (status, payload) = recv(&info, [0x80, 0x06, 0x00, 0x03, 0x00, 0x00, 0xff, 0x00]);
        assert_eq!(status, 0);
        assert_eq!(payload, vec![0x04, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn get_status_reports_self_powered() {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001).build();
        let (status, payload) = recv(&info, [0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00]);
        assert_eq!(status, 0);
        assert_eq!(payload, vec![0x01, 0x00]);
    }

    #[test]
    fn set_configuration_replies_empty_success() {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001).build();
        // E6: bmRequestType=0x00, bRequest=0x09, wValue=0x0001
        let (status, payload) = recv(&info, [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(status, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn unknown_request_is_permissive() {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001).build();
        let (status, payload) = recv(&info, [0x40, 0xaa, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(status, 0);
        assert!(payload.is_empty());
    }
}
