//! USB/IP wire records: the OP-phase (enumerate/attach) and URB-phase
//! (submit/unlink) frames exchanged with a remote client.
//!
//! Every record here is big-endian by default — `packed_struct`'s
//! `msb0` bit numbering makes an unmarked multi-byte integer field
//! big-endian, which is exactly what the USB/IP wire format wants. Only
//! the SETUP packet embedded in a CMD_SUBMIT ([`crate::usb::SetupRequest`])
//! breaks that rule, because it's USB, not USB/IP.

use packed_struct::prelude::*;

/// `01 11`: the only version this server (or any USB/IP implementation
/// in practice) speaks.
pub const USBIP_VERSION: u16 = 0x0111;

pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

/// Transfer direction as carried in `CMD_SUBMIT.direction`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_u32(value: u32) -> Self {
        if value == 1 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// 8-byte header common to every OP-phase message.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct OpHeader {
    #[packed_field(bytes = "0..=1")]
    pub version: u16,
    #[packed_field(bytes = "2..=3")]
    pub command: u16,
    #[packed_field(bytes = "4..=7")]
    pub status: u32,
}

impl OpHeader {
    pub fn new(command: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            command,
            status,
        }
    }
}

/// 312-byte device identity record, carried in both `OP_REP_DEVLIST`
/// (one per exported device) and `OP_REP_IMPORT` (the attached device).
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "312")]
pub struct DeviceInfo {
    #[packed_field(bytes = "0..=255", element_size_bytes = "1")]
    pub path: [u8; 256],
    #[packed_field(bytes = "256..=287", element_size_bytes = "1")]
    pub busid: [u8; 32],
    #[packed_field(bytes = "288..=291")]
    pub busnum: u32,
    #[packed_field(bytes = "292..=295")]
    pub devnum: u32,
    #[packed_field(bytes = "296..=299")]
    pub speed: u32,
    #[packed_field(bytes = "300..=301")]
    pub id_vendor: u16,
    #[packed_field(bytes = "302..=303")]
    pub id_product: u16,
    #[packed_field(bytes = "304..=305")]
    pub bcd_device: u16,
    #[packed_field(bytes = "306")]
    pub b_device_class: u8,
    #[packed_field(bytes = "307")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "308")]
    pub b_device_protocol: u8,
    #[packed_field(bytes = "309")]
    pub b_configuration_value: u8,
    #[packed_field(bytes = "310")]
    pub b_num_configurations: u8,
    #[packed_field(bytes = "311")]
    pub b_num_interfaces: u8,
}

impl DeviceInfo {
    /// NUL-pads `path` and `busid` to their declared widths, truncating
    /// if the caller passed something too long to fit.
    pub fn new(path: &str, busid: &str) -> Self {
        Self {
            path: pad_bytes::<256>(path.as_bytes()),
            busid: pad_bytes::<32>(busid.as_bytes()),
            busnum: 0,
            devnum: 0,
            speed: 0,
            id_vendor: 0,
            id_product: 0,
            bcd_device: 0,
            b_device_class: 0,
            b_device_sub_class: 0,
            b_device_protocol: 0,
            b_configuration_value: 0,
            b_num_configurations: 0,
            b_num_interfaces: 0,
        }
    }
}

fn pad_bytes<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = src.len().min(N);
    out[..len].copy_from_slice(&src[..len]);
    out
}

/// 4-byte per-interface summary appended after each device's
/// [`DeviceInfo`] in an `OP_REP_DEVLIST` reply.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "4")]
pub struct InterfaceInfo {
    #[packed_field(bytes = "0")]
    pub b_interface_class: u8,
    #[packed_field(bytes = "1")]
    pub b_interface_sub_class: u8,
    #[packed_field(bytes = "2")]
    pub b_interface_protocol: u8,
    #[packed_field(bytes = "3")]
    pub padding: u8,
}

impl InterfaceInfo {
    pub fn new(class: u8, sub_class: u8, protocol: u8) -> Self {
        Self {
            b_interface_class: class,
            b_interface_sub_class: sub_class,
            b_interface_protocol: protocol,
            padding: 0,
        }
    }
}

/// 20-byte header common to both `CMD_SUBMIT`/`CMD_UNLINK` and their
/// `RET_*` replies: command code, sequence number, device id, transfer
/// direction and endpoint.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "20")]
pub struct CommandHeader {
    #[packed_field(bytes = "0..=3")]
    pub command: u32,
    #[packed_field(bytes = "4..=7")]
    pub seqnum: u32,
    #[packed_field(bytes = "8..=11")]
    pub devid: u32,
    #[packed_field(bytes = "12..=15")]
    pub direction: u32,
    #[packed_field(bytes = "16..=19")]
    pub ep: u32,
}

/// Peeks the `command` field out of a 48-byte URB-phase preamble
/// without fully unpacking it, so the session loop can decide which
/// concrete record to unpack.
pub fn peek_command(preamble: &[u8; 48]) -> u32 {
    u32::from_be_bytes([preamble[0], preamble[1], preamble[2], preamble[3]])
}

/// 48-byte `USBIP_CMD_SUBMIT`: a URB submission. `setup` is the opaque
/// 8-byte SETUP packet when `ep == 0`; otherwise its contents are
/// unspecified and ignored.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct CmdSubmit {
    #[packed_field(bytes = "0..=19")]
    pub header: CommandHeader,
    #[packed_field(bytes = "20..=23")]
    pub transfer_flags: u32,
    #[packed_field(bytes = "24..=27")]
    pub transfer_buffer_length: u32,
    #[packed_field(bytes = "28..=31")]
    pub start_frame: u32,
    #[packed_field(bytes = "32..=35")]
    pub number_of_packets: u32,
    #[packed_field(bytes = "36..=39")]
    pub interval: u32,
    #[packed_field(bytes = "40..=47", element_size_bytes = "1")]
    pub setup: [u8; 8],
}

impl CmdSubmit {
    pub fn direction(&self) -> Direction {
        Direction::from_u32(self.header.direction)
    }
}

/// 48-byte `USBIP_RET_SUBMIT`: the reply to a `CmdSubmit`. `setup` is
/// always zeroed on replies. `number_of_packets` is 0 for the
/// non-isochronous transfers this server handles, following the
/// USB/IP reference implementation rather than the `0xFFFFFFFF` some
/// userspace servers emit.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct RetSubmit {
    #[packed_field(bytes = "0..=19")]
    pub header: CommandHeader,
    #[packed_field(bytes = "20..=23")]
    pub status: u32,
    #[packed_field(bytes = "24..=27")]
    pub actual_length: u32,
    #[packed_field(bytes = "28..=31")]
    pub start_frame: u32,
    #[packed_field(bytes = "32..=35")]
    pub number_of_packets: u32,
    #[packed_field(bytes = "36..=39")]
    pub error_count: u32,
    #[packed_field(bytes = "40..=47", element_size_bytes = "1")]
    pub setup: [u8; 8],
}

impl RetSubmit {
    /// Builds the reply to `cmd`, copying its `seqnum`/`devid`/
    /// `direction`/`ep` as the preamble requires.
    pub fn for_request(cmd: &CmdSubmit, status: i32, payload_len: usize) -> Self {
        Self {
            header: CommandHeader {
                command: USBIP_RET_SUBMIT,
                seqnum: cmd.header.seqnum,
                devid: cmd.header.devid,
                direction: cmd.header.direction,
                ep: cmd.header.ep,
            },
            status: status as u32,
            actual_length: payload_len as u32,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0; 8],
        }
    }
}

/// 48-byte `USBIP_CMD_UNLINK`: request to cancel a previously submitted
/// URB identified by `unlink_seqnum`.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct CmdUnlink {
    #[packed_field(bytes = "0..=19")]
    pub header: CommandHeader,
    #[packed_field(bytes = "20..=23")]
    pub unlink_seqnum: u32,
    #[packed_field(bytes = "24..=47", element_size_bytes = "1")]
    pub reserved: [u8; 24],
}

/// 48-byte `USBIP_RET_UNLINK`: reply to a `CmdUnlink`. This server
/// tracks no in-flight URB table, so every unlink succeeds
/// unconditionally with `status = 0`.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct RetUnlink {
    #[packed_field(bytes = "0..=19")]
    pub header: CommandHeader,
    #[packed_field(bytes = "20..=23")]
    pub status: u32,
    #[packed_field(bytes = "24..=47", element_size_bytes = "1")]
    pub reserved: [u8; 24],
}

impl RetUnlink {
    pub fn for_request(cmd: &CmdUnlink, status: i32) -> Self {
        Self {
            header: CommandHeader {
                command: USBIP_RET_UNLINK,
                seqnum: cmd.header.seqnum,
                devid: cmd.header.devid,
                direction: cmd.header.direction,
                ep: cmd.header.ep,
            },
            status: status as u32,
            reserved: [0; 24],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_header_encodes_version_big_endian() {
        let header = OpHeader::new(OP_REP_DEVLIST, 0);
        let packed = header.pack().unwrap();
        assert_eq!(&packed[0..2], &[0x01, 0x11]);
        assert_eq!(&packed[2..4], &[0x00, 0x05]);
    }

    #[test]
    fn device_info_round_trip() {
        let mut info = DeviceInfo::new("/sys/devices/pci0000:00/0000:00:01.2/usb1/1-1", "1-1");
        info.busnum = 1;
        info.devnum = 2;
        info.speed = 2;
        let packed = info.pack().unwrap();
        let unpacked = DeviceInfo::unpack(&packed).unwrap();
        assert_eq!(info, unpacked);
        assert_eq!(&packed[288..292], &1u32.to_be_bytes());
    }

    #[test]
    fn device_info_pads_busid_with_nul() {
        let info = DeviceInfo::new("/path", "1-1");
        assert_eq!(&info.busid[0..3], b"1-1");
        assert_eq!(info.busid[3], 0);
    }

    #[test]
    fn cmd_submit_round_trip_and_peek_command() {
        let cmd = CmdSubmit {
            header: CommandHeader {
                command: USBIP_CMD_SUBMIT,
                seqnum: 42,
                devid: 1,
                direction: Direction::In as u32,
                ep: 0,
            },
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        };
        let packed = cmd.pack().unwrap();
        assert_eq!(peek_command(&packed), USBIP_CMD_SUBMIT);
        let unpacked = CmdSubmit::unpack(&packed).unwrap();
        assert_eq!(unpacked, cmd);
        assert_eq!(unpacked.direction(), Direction::In);
    }

    #[test]
    fn ret_submit_copies_seqnum_from_request() {
        let cmd = CmdSubmit {
            header: CommandHeader {
                command: USBIP_CMD_SUBMIT,
                seqnum: 7,
                devid: 1,
                direction: Direction::Out as u32,
                ep: 2,
            },
            transfer_flags: 0,
            transfer_buffer_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
        };
        let ret = RetSubmit::for_request(&cmd, 0, 0);
        assert_eq!(ret.header.seqnum, 7);
        assert_eq!(ret.header.command, USBIP_RET_SUBMIT);
        assert_eq!(ret.number_of_packets, 0);
    }

    #[test]
    fn ret_unlink_copies_seqnum_from_request() {
        let cmd = CmdUnlink {
            header: CommandHeader {
                command: USBIP_CMD_UNLINK,
                seqnum: 99,
                devid: 1,
                direction: Direction::Out as u32,
                ep: 0,
            },
            unlink_seqnum: 98,
            reserved: [0; 24],
        };
        let ret = RetUnlink::for_request(&cmd, 0);
        assert_eq!(ret.header.seqnum, 99);
        assert_eq!(ret.status, 0);
    }
}
