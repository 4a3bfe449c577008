//! Per-connection session state machine: `ExpectOp` (enumerate/attach)
//! then `Attached` (URB traffic), framed over any `Read + Write`
//! transport with per-phase read deadlines.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use packed_struct::prelude::*;

use crate::device::{ReplySink, VirtualUsbDevice};
use crate::error::{Result, UsbIpError};
use crate::usbip::{
    peek_command, CmdSubmit, CmdUnlink, Direction as UsbipDirection, OpHeader, RetSubmit,
    RetUnlink, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, USBIP_CMD_SUBMIT,
    USBIP_CMD_UNLINK,
};

const OP_READ_TIMEOUT: Duration = Duration::from_secs(10);
const URB_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
const PAYLOAD_READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lets [`Session`] apply per-phase read deadlines without caring
/// whether the underlying transport is a real socket or an in-memory
/// test double. `TcpStream` enforces the deadline; anything else (the
/// mock stream used in tests) just ignores it.
pub trait SetReadDeadline {
    fn set_read_deadline(&mut self, timeout: Duration) -> io::Result<()>;
}

impl SetReadDeadline for TcpStream {
    fn set_read_deadline(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }
}

/// Drives one client connection through the USB/IP session FSM.
pub struct Session<S> {
    stream: S,
    devices: Arc<[VirtualUsbDevice]>,
}

impl Session<TcpStream> {
    pub fn new(stream: TcpStream, devices: Arc<[VirtualUsbDevice]>) -> io::Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self { stream, devices })
    }
}

impl<S> Session<S>
where
    S: Read + Write + SetReadDeadline,
{
    pub fn from_parts(stream: S, devices: Arc<[VirtualUsbDevice]>) -> Self {
        Self { stream, devices }
    }

    /// Runs the session to completion: OP phase, then URB phase if an
    /// import succeeds. Returns once the connection is closed for any
    /// reason (clean close, framing error, timeout, I/O failure); every
    /// exit path here leaves the underlying transport for the caller to
    /// drop.
    pub fn run(&mut self) {
        loop {
            match self.read_op_header() {
                Ok(Some(header)) => match header.command {
                    OP_REQ_DEVLIST => {
                        if let Err(e) = self.handle_devlist() {
                            debug!("failed to reply to DEVLIST: {e}");
                            return;
                        }
                        // Spec: remain in ExpectOp; loop reads another header.
                    }
                    OP_REQ_IMPORT => match self.handle_import() {
                        Ok(Some(device_index)) => {
                            if let Err(e) = self.run_attached(device_index) {
                                debug!("attached session ended: {e}");
                            }
                            return;
                        }
                        Ok(None) => return,
                        Err(e) => {
                            debug!("import failed: {e}");
                            return;
                        }
                    },
                    other => {
                        debug!("unexpected op command {other:#06x}; closing");
                        return;
                    }
                },
                Ok(None) => return,
                Err(e) => {
                    debug!("op phase error: {e}");
                    return;
                }
            }
        }
    }

    fn read_op_header(&mut self) -> Result<Option<OpHeader>> {
        self.stream
            .set_read_deadline(OP_READ_TIMEOUT)
            .map_err(UsbIpError::Io)?;
        let mut header_buf = [0u8; 8];
        if !self.read_exact_or_eof(&mut header_buf)? {
            return Ok(None);
        }
        Ok(Some(OpHeader::unpack(&header_buf)?))
    }

    fn handle_devlist(&mut self) -> Result<()> {
        let mut out = OpHeader::new(OP_REP_DEVLIST, 0).pack()?.to_vec();
        out.extend_from_slice(&(self.devices.len() as u32).to_be_bytes());
        for device in self.devices.iter() {
            let (dev_info, interfaces) = device.describe_for_devlist();
            out.extend_from_slice(&dev_info.pack()?);
            for iface in interfaces {
                out.extend_from_slice(&iface.pack()?);
            }
        }
        self.write_all(&out)
    }

    fn handle_import(&mut self) -> Result<Option<usize>> {
        let mut busid_buf = [0u8; 32];
        if !self.read_exact_or_eof(&mut busid_buf)? {
            return Ok(None);
        }
        let busid = String::from_utf8_lossy(&busid_buf);
        let busid = busid.trim_end_matches('\0');

        match self.devices.iter().position(|d| d.busid == busid) {
            Some(index) => {
                let dev_info = self.devices[index].describe_for_import();
                let mut out = OpHeader::new(OP_REP_IMPORT, 0).pack()?.to_vec();
                out.extend_from_slice(&dev_info.pack()?);
                self.write_all(&out)?;
                Ok(Some(index))
            }
            None => {
                debug!("import of unknown busid {busid:?}; closing");
                let out = OpHeader::new(OP_REP_IMPORT, 1).pack()?;
                self.write_all(&out)?;
                Ok(None)
            }
        }
    }

    fn run_attached(&mut self, device_index: usize) -> Result<()> {
        loop {
            self.stream
                .set_read_deadline(URB_HEADER_READ_TIMEOUT)
                .map_err(UsbIpError::Io)?;
            let mut preamble = [0u8; 48];
            if !self.read_exact_or_eof(&mut preamble)? {
                return Ok(());
            }

            match peek_command(&preamble) {
                USBIP_CMD_SUBMIT => self.handle_cmd_submit(&preamble, device_index)?,
                USBIP_CMD_UNLINK => {
                    let cmd = CmdUnlink::unpack(&preamble)?;
                    let ret = RetUnlink::for_request(&cmd, 0);
                    self.write_all(&ret.pack()?)?;
                }
                other => {
                    debug!("unexpected URB command {other:#010x}; closing");
                    return Ok(());
                }
            }
        }
    }

    fn handle_cmd_submit(&mut self, preamble: &[u8; 48], device_index: usize) -> Result<()> {
        let cmd = CmdSubmit::unpack(preamble)?;

        let mut payload = Vec::new();
        if cmd.direction() == UsbipDirection::Out && cmd.transfer_buffer_length > 0 {
            self.stream
                .set_read_deadline(PAYLOAD_READ_TIMEOUT)
                .map_err(UsbIpError::Io)?;
            payload = vec![0u8; cmd.transfer_buffer_length as usize];
            if !self.read_exact_or_eof(&mut payload)? {
                return Ok(());
            }
        }

        let Session { stream, devices } = self;
        let device = &devices[device_index];
        let mut sink = SocketReplySink {
            cmd: &cmd,
            writer: stream,
            replied: false,
        };
        device.handle_urb(&cmd, &payload, &mut sink);
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes, relying on `Read::read_exact`'s
    /// own retry loop to absorb short reads. A clean peer close before
    /// any byte of the record arrives is reported as `Ok(false)`;
    /// anything else (partial-then-EOF, timeout, other I/O error) is an
    /// error, since it means the peer violated framing mid-record.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(UsbIpError::Io(e)),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).map_err(UsbIpError::Io)
    }
}

/// Writes the `RET_SUBMIT` for a single `CmdSubmit` to the session's
/// transport. Honors only the first call, per [`ReplySink`]'s contract.
struct SocketReplySink<'a, W: Write> {
    cmd: &'a CmdSubmit,
    writer: &'a mut W,
    replied: bool,
}

impl<'a, W: Write> ReplySink for SocketReplySink<'a, W> {
    fn send(&mut self, status: i32, payload: &[u8]) {
        if self.replied {
            return;
        }
        self.replied = true;

        let ret = match RetSubmit::for_request(self.cmd, status, payload.len()).pack() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode RET_SUBMIT: {e}");
                return;
            }
        };
        if let Err(e) = self.writer.write_all(&ret) {
            warn!("failed to write RET_SUBMIT: {e}");
            return;
        }
        if let Err(e) = self.writer.write_all(payload) {
            warn!("failed to write RET_SUBMIT payload: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::VirtualUsbDeviceBuilder;
    use std::collections::VecDeque;

    /// In-memory duplex stream: reads drain a pre-loaded input queue,
    /// writes accumulate into `output` for assertions. Read deadlines
    /// are a no-op since there's no real blocking to bound.
    struct MockStream {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl MockStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: VecDeque::from(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            if self.input.is_empty() {
                return Ok(0);
            }
            let n = buf.len().min(self.input.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SetReadDeadline for MockStream {
        fn set_read_deadline(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }
    }

    fn demo_devices() -> Arc<[VirtualUsbDevice]> {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001).build();
        let device = VirtualUsbDevice::new(
            info,
            "/sys/devices/pci0000:00/0000:00:01.2/usb1/1-1",
            "1-1",
        );
        Arc::from(vec![device])
    }

    #[test]
    fn e1_devlist_reports_one_device() {
        let devices = demo_devices();
        let stream = MockStream::new(vec![0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]);
        let mut session = Session::from_parts(stream, devices);
        session.run();

        let out = &session.stream.output;
        assert_eq!(&out[0..8], &[0x01, 0x11, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&out[8..12], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(out.len(), 12 + 312); // header+count + one DeviceInfo, no interfaces
    }

    #[test]
    fn e2_import_known_busid_attaches() {
        let devices = demo_devices();
        let mut input = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
        let mut busid = b"1-1".to_vec();
        busid.resize(32, 0);
        input.extend(busid);

        let stream = MockStream::new(input);
        let mut session = Session::from_parts(stream, devices);
        session.run();

        let out = &session.stream.output;
        assert_eq!(&out[0..8], &[0x01, 0x11, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(out.len(), 8 + 312);
    }

    #[test]
    fn e3_import_unknown_busid_closes_with_error_status() {
        let devices = demo_devices();
        let mut input = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
        let mut busid = b"no-such".to_vec();
        busid.resize(32, 0);
        input.extend(busid);

        let stream = MockStream::new(input);
        let mut session = Session::from_parts(stream, devices);
        session.run();

        let out = &session.stream.output;
        assert_eq!(out.len(), 8);
        assert_ne!(
            u32::from_be_bytes([out[4], out[5], out[6], out[7]]),
            0
        );
    }

    #[test]
    fn e4_get_descriptor_device_after_attach() {
        let devices = demo_devices();
        let mut input = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
        let mut busid = b"1-1".to_vec();
        busid.resize(32, 0);
        input.extend(busid);
        input.extend([
            0x00, 0x00, 0x00, 0x01, // CMD_SUBMIT
            0x00, 0x00, 0x00, 0x2a, // seqnum
            0x00, 0x00, 0x00, 0x00, // devid
            0x00, 0x00, 0x00, 0x01, // direction IN
            0x00, 0x00, 0x00, 0x00, // ep 0
            0x00, 0x00, 0x00, 0x00, // transfer_flags
            0x00, 0x00, 0x00, 0x00, // transfer_buffer_length
            0x00, 0x00, 0x00, 0x00, // start_frame
            0x00, 0x00, 0x00, 0x00, // number_of_packets
            0x00, 0x00, 0x00, 0x00, // interval
            0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00, // SETUP
        ]);

        let stream = MockStream::new(input);
        let mut session = Session::from_parts(stream, devices);
        session.run();

        let out = &session.stream.output;
        let import_reply_len = 8 + 312;
        let ret_submit = &out[import_reply_len..];
        assert_eq!(
            u32::from_be_bytes([ret_submit[0], ret_submit[1], ret_submit[2], ret_submit[3]]),
            3
        );
        assert_eq!(
            u32::from_be_bytes([ret_submit[4], ret_submit[5], ret_submit[6], ret_submit[7]]),
            0x2a
        );
        let actual_length = u32::from_be_bytes([
            ret_submit[24],
            ret_submit[25],
            ret_submit[26],
            ret_submit[27],
        ]);
        assert_eq!(actual_length, 18);
        assert_eq!(ret_submit.len(), 48 + 18);
    }

    #[test]
    fn e7_unlink_echoes_seqnum() {
        let devices = demo_devices();
        let mut input = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
        let mut busid = b"1-1".to_vec();
        busid.resize(32, 0);
        input.extend(busid);
        input.extend([
            0x00, 0x00, 0x00, 0x02, // CMD_UNLINK
            0x00, 0x00, 0x00, 0x63, // seqnum
            0x00, 0x00, 0x00, 0x00, // devid
            0x00, 0x00, 0x00, 0x00, // direction
            0x00, 0x00, 0x00, 0x00, // ep
            0x00, 0x00, 0x00, 0x62, // unlink_seqnum
        ]);
        input.extend([0u8; 24]); // reserved

        let stream = MockStream::new(input);
        let mut session = Session::from_parts(stream, devices);
        session.run();

        let out = &session.stream.output;
        let unlink_reply = &out[8 + 312..];
        assert_eq!(
            u32::from_be_bytes([
                unlink_reply[0],
                unlink_reply[1],
                unlink_reply[2],
                unlink_reply[3]
            ]),
            4
        );
        assert_eq!(
            u32::from_be_bytes([
                unlink_reply[4],
                unlink_reply[5],
                unlink_reply[6],
                unlink_reply[7]
            ]),
            0x63
        );
        assert_eq!(
            u32::from_be_bytes([
                unlink_reply[20],
                unlink_reply[21],
                unlink_reply[22],
                unlink_reply[23]
            ]),
            0
        );
    }
}
