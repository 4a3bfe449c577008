//! Descriptor tree for a virtual USB device: device, configuration,
//! interface and endpoint descriptors, plus the SETUP packet that
//! control transfers carry.
//!
//! Every descriptor is a fixed-layout [`PackedStruct`] with big-endian
//! `msb0` bit numbering for the struct itself and an explicit `endian =
//! "lsb"` override on each multi-byte field, since every USB descriptor
//! field wider than a byte is little-endian on the wire (USB 2.0 spec,
//! table 9-8 and friends). This mirrors the teacher's own descriptor
//! structs; the difference here is that every `todo!()` is filled in
//! and the tree actually owns its children instead of acquiring them by
//! later assignment.

pub mod builder;

use packed_struct::prelude::*;

pub use builder::{ConfigurationBuilder, EndpointBuilder, InterfaceBuilder, VirtualUsbDeviceBuilder};

/// Descriptor type, used both as `bDescriptorType` and as the high byte
/// of `wValue` in a `GET_DESCRIPTOR` request.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
}

/// `bDeviceClass` values relevant to this server. Devices that declare
/// their class at the interface level (the common case for composite
/// and HID devices) use `UseInterface`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceClass {
    UseInterface = 0x00,
    Communications = 0x02,
    Hid = 0x03,
    PrinterOrImaging = 0x07,
    VendorSpecific = 0xFF,
}

/// Transfer direction, as encoded in bit 7 of `bEndpointAddress` and
/// `bmRequestType`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

/// `bmRequestType` request-type field (bits 6..5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Type {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// `bmRequestType` recipient field (bits 4..0).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Mask for the request-type bits of `bmRequestType`.
pub const TYPE_MASK: u8 = 0b0110_0000;
/// Mask for the recipient bits of `bmRequestType`.
pub const RECIPIENT_MASK: u8 = 0b0001_1111;
/// Mask for the direction bit of `bmRequestType`.
pub const DIRECTION_MASK: u8 = 0b1000_0000;

/// Standard device requests (`bRequest` when `Type::Standard`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0a,
    SetInterface = 0x0b,
    SynchFrame = 0x0c,
}

impl StandardRequest {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::GetStatus,
            0x01 => Self::ClearFeature,
            0x03 => Self::SetFeature,
            0x05 => Self::SetAddress,
            0x06 => Self::GetDescriptor,
            0x07 => Self::SetDescriptor,
            0x08 => Self::GetConfiguration,
            0x09 => Self::SetConfiguration,
            0x0a => Self::GetInterface,
            0x0b => Self::SetInterface,
            0x0c => Self::SynchFrame,
            _ => return None,
        })
    }
}

/// Language ID used by string descriptor index 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LangId {
    EnglishUnitedStates = 0x0409,
}

/// Endpoint transfer type (`bmAttributes` bits 1..0).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Isochronous synchronization type (`bmAttributes` bits 3..2). Ignored
/// for non-isochronous endpoints.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SynchronizationType {
    NoSynchronization = 0,
    Asynchronous = 1,
    Adaptive = 2,
    Synchronous = 3,
}

/// Isochronous usage type (`bmAttributes` bits 5..4). Ignored for
/// non-isochronous endpoints.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsageType {
    Data = 0,
    Feedback = 1,
    ImplicitFeedback = 2,
    Reserved = 3,
}

/// The Device Descriptor is the root of the descriptor tree and
/// contains basic device information. 18 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "18")]
pub struct DeviceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    #[packed_field(bytes = "8..=9", endian = "lsb")]
    pub id_vendor: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "10..=11", endian = "lsb")]
    pub id_product: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "12..=13", endian = "lsb")]
    pub bcd_device: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "14")]
    pub i_manufacturer: u8,
    #[packed_field(bytes = "15")]
    pub i_product: u8,
    #[packed_field(bytes = "16")]
    pub i_serial_number: u8,
    #[packed_field(bytes = "17")]
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            b_length: 18,
            b_descriptor_type: DescriptorType::Device as u8,
            bcd_usb: Integer::from_primitive(0x0200),
            b_device_class: DeviceClass::UseInterface as u8,
            b_device_sub_class: 0x00,
            b_device_protocol: 0x00,
            b_max_packet_size_0: 0x40,
            id_vendor: Integer::from_primitive(vendor_id),
            id_product: Integer::from_primitive(product_id),
            bcd_device: Integer::from_primitive(0x0100),
            i_manufacturer: 0,
            i_product: 0,
            i_serial_number: 0,
            b_num_configurations: 1,
        }
    }
}

/// High-speed capable devices report how they'd behave at the other
/// speed through this descriptor. 10 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "10")]
pub struct DeviceQualifierDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    #[packed_field(bytes = "8")]
    pub b_num_configurations: u8,
    #[packed_field(bytes = "9")]
    pub b_reserved: u8,
}

impl DeviceQualifierDescriptor {
    pub fn new() -> Self {
        Self {
            b_length: 10,
            b_descriptor_type: DescriptorType::DeviceQualifier as u8,
            bcd_usb: Integer::from_primitive(0x0200),
            b_device_class: DeviceClass::UseInterface as u8,
            b_device_sub_class: 0x00,
            b_device_protocol: 0x00,
            b_max_packet_size_0: 0x40,
            b_num_configurations: 1,
            b_reserved: 0,
        }
    }
}

impl Default for DeviceQualifierDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// 9-byte configuration descriptor header. Owns no children directly —
/// [`Configuration`] pairs it with the interface list and serializes the
/// whole tree.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct ConfigurationDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_total_length: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_num_interfaces: u8,
    #[packed_field(bytes = "5")]
    pub b_configuration_value: u8,
    #[packed_field(bytes = "6")]
    pub i_configuration: u8,
    #[packed_field(bytes = "7")]
    pub bm_attributes: u8,
    #[packed_field(bytes = "8")]
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    pub fn new(configuration_value: u8) -> Self {
        Self {
            b_length: 9,
            b_descriptor_type: DescriptorType::Configuration as u8,
            w_total_length: Integer::from_primitive(9),
            b_num_interfaces: 0,
            b_configuration_value: configuration_value,
            i_configuration: 0,
            bm_attributes: 0x80, // bus-powered, no remote wakeup
            b_max_power: 50,     // 100 mA
        }
    }
}

/// Self-powered bit (D6) of `bmAttributes`.
pub const SELF_POWERED: u8 = 0x40;

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct InterfaceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_interface_number: u8,
    #[packed_field(bytes = "3")]
    pub b_alternate_setting: u8,
    #[packed_field(bytes = "4")]
    pub b_num_endpoints: u8,
    #[packed_field(bytes = "5")]
    pub b_interface_class: u8,
    #[packed_field(bytes = "6")]
    pub b_interface_sub_class: u8,
    #[packed_field(bytes = "7")]
    pub b_interface_protocol: u8,
    #[packed_field(bytes = "8")]
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub fn new(interface_number: u8) -> Self {
        Self {
            b_length: 9,
            b_descriptor_type: DescriptorType::Interface as u8,
            b_interface_number: interface_number,
            b_alternate_setting: 0,
            b_num_endpoints: 0,
            b_interface_class: DeviceClass::VendorSpecific as u8,
            b_interface_sub_class: 0,
            b_interface_protocol: 0,
            i_interface: 0,
        }
    }
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "7")]
pub struct EndpointDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_endpoint_address: u8,
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_max_packet_size: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6")]
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            b_length: 7,
            b_descriptor_type: DescriptorType::Endpoint as u8,
            b_endpoint_address: address,
            bm_attributes: attributes,
            w_max_packet_size: Integer::from_primitive(max_packet_size),
            b_interval: interval,
        }
    }
}

/// An interface and everything that hangs off it: its endpoints and any
/// class-specific "extra" descriptors (e.g. HID or CDC functional
/// descriptors) that must be emitted between the interface descriptor
/// and its endpoints in the configuration blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub descriptor: InterfaceDescriptor,
    pub extras: Vec<Vec<u8>>,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl Interface {
    pub fn new(interface_number: u8) -> Self {
        Self {
            descriptor: InterfaceDescriptor::new(interface_number),
            extras: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    /// `InterfaceDescriptor ‖ extras ‖ endpoints`, in that order.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.descriptor.pack().expect("fixed-size pack").to_vec();
        for extra in &self.extras {
            out.extend_from_slice(extra);
        }
        for endpoint in &self.endpoints {
            out.extend_from_slice(&endpoint.pack().expect("fixed-size pack"));
        }
        out
    }
}

/// A configuration and its interfaces. `serialize()` produces the exact
/// byte blob a `GET_DESCRIPTOR(CONFIGURATION)` request returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub descriptor: ConfigurationDescriptor,
    pub interfaces: Vec<Interface>,
}

impl Configuration {
    pub fn new(configuration_value: u8) -> Self {
        Self {
            descriptor: ConfigurationDescriptor::new(configuration_value),
            interfaces: Vec::new(),
        }
    }

    /// `ConfigurationDescriptor ‖ (InterfaceDescriptor ‖ extras ‖
    /// endpoints)*`, with `wTotalLength` and `bNumInterfaces`
    /// back-patched to match before serializing.
    pub fn serialize(&mut self) -> Vec<u8> {
        self.descriptor.b_num_interfaces = self.interfaces.len() as u8;

        let mut body = Vec::new();
        for interface in &self.interfaces {
            body.extend(interface.serialize());
        }

        let total_len = self.descriptor.b_length as usize + body.len();
        self.descriptor.w_total_length = Integer::from_primitive(total_len as u16);

        let mut out = self.descriptor.pack().expect("fixed-size pack").to_vec();
        out.extend(body);
        out
    }
}

/// A UTF-16LE string descriptor (`bLength ‖ bDescriptorType=3 ‖ UTF-16LE
/// chars`, no terminator).
#[derive(Debug, Clone, PartialEq)]
pub struct StringDescriptor {
    text: String,
}

impl StringDescriptor {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let units: Vec<u16> = self.text.encode_utf16().collect();
        let mut out = Vec::with_capacity(2 + units.len() * 2);
        out.push((2 + units.len() * 2) as u8);
        out.push(DescriptorType::String as u8);
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }
}

impl From<&str> for StringDescriptor {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The 8-byte SETUP packet carried in `CMD_SUBMIT.setup` when `ep ==
/// 0`. `bmRequestType` and `bRequest` are single bytes; `wValue`,
/// `wIndex` and `wLength` are little-endian 16-bit fields, per the USB
/// spec — the enclosing USB/IP frame is big-endian, but the SETUP
/// packet it carries is an opaque 8-byte blob whose internal structure
/// follows USB, not USB/IP, endianness.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct SetupRequest {
    #[packed_field(bytes = "0")]
    pub bm_request_type: u8,
    #[packed_field(bytes = "1")]
    pub b_request: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_value: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_index: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6..=7", endian = "lsb")]
    pub w_length: Integer<u16, packed_bits::Bits<16>>,
}

impl SetupRequest {
    pub fn direction(&self) -> Direction {
        if self.bm_request_type & DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn request_type(&self) -> Type {
        match (self.bm_request_type & TYPE_MASK) >> 5 {
            0 => Type::Standard,
            1 => Type::Class,
            2 => Type::Vendor,
            _ => Type::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.bm_request_type & RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    pub fn standard_request(&self) -> Option<StandardRequest> {
        StandardRequest::from_u8(self.b_request)
    }

    /// High byte of `wValue`: the descriptor type for GET_DESCRIPTOR.
    pub fn descriptor_type(&self) -> Option<DescriptorType> {
        DescriptorType::from_primitive((self.w_value.to_primitive() >> 8) as u8)
    }

    /// Low byte of `wValue`: the descriptor index for GET_DESCRIPTOR.
    pub fn descriptor_index(&self) -> u8 {
        (self.w_value.to_primitive() & 0x00FF) as u8
    }
}

/// All descriptors and identity fields that make up a virtual USB
/// device's fixed, immutable descriptor tree.
#[derive(Debug, Clone)]
pub struct Info {
    pub device_desc: DeviceDescriptor,
    pub device_qualifier_desc: DeviceQualifierDescriptor,
    pub configs: Vec<Configuration>,
    pub string_descs: Vec<StringDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_round_trip() {
        let dev = DeviceDescriptor::new(0x1234, 0x5678);
        let packed = dev.pack().unwrap();
        let unpacked = DeviceDescriptor::unpack(&packed).unwrap();
        assert_eq!(dev, unpacked);
    }

    #[test]
    fn device_descriptor_bcd_usb_is_little_endian() {
        let dev = DeviceDescriptor::new(0x1234, 0x5678);
        let packed = dev.pack().unwrap();
        // bcdUSB = 0x0200 (USB 2.0), little-endian bytes: 00 02
        assert_eq!(&packed[2..4], &[0x00, 0x02]);
    }

    #[test]
    fn configuration_serialize_matches_total_length() {
        let mut config = Configuration::new(1);
        let mut iface = Interface::new(0);
        iface
            .endpoints
            .push(EndpointDescriptor::new(0x81, 0x03, 8, 10));
        iface.descriptor.b_num_endpoints = iface.endpoints.len() as u8;
        config.interfaces.push(iface);

        let blob = config.serialize();
        assert_eq!(blob.len(), config.descriptor.w_total_length.to_primitive() as usize);
        assert_eq!(config.descriptor.b_num_interfaces as usize, config.interfaces.len());
    }

    #[test]
    fn setup_request_decodes_get_descriptor_device() {
        // 80 06 00 01 00 00 12 00: IN, std, device, GET_DESCRIPTOR,
        // wValue=0x0100 (DEVICE, index 0), wLength=0x0012
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupRequest::unpack(&bytes).unwrap();
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.request_type(), Type::Standard);
        assert_eq!(setup.recipient(), Recipient::Device);
        assert_eq!(setup.standard_request(), Some(StandardRequest::GetDescriptor));
        assert_eq!(setup.descriptor_type(), Some(DescriptorType::Device));
        assert_eq!(setup.descriptor_index(), 0);
        assert_eq!(setup.w_length.to_primitive(), 0x0012);
    }
}
