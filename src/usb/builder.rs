//! Fluent builders for assembling a [`super::Info`] descriptor tree.
//!
//! The teacher's example binaries (`examples/virtual_hid`,
//! `examples/steam_deck`) already call into an API shaped exactly like
//! this one — `ConfigurationBuilder`, `InterfaceBuilder`,
//! `EndpointBuilder` chained with `.add_interface(...)` /
//! `.add_endpoint(...)` — without the types ever having been defined.
//! This module is that API, completed.

use super::{
    Configuration, ConfigurationDescriptor, DeviceClass, DeviceDescriptor,
    DeviceQualifierDescriptor, Direction, EndpointDescriptor, Info, Interface,
    InterfaceDescriptor, StringDescriptor, SynchronizationType, TransferType, UsageType,
};

/// Builds an [`Info`] descriptor tree for a virtual device.
pub struct VirtualUsbDeviceBuilder {
    device_desc: DeviceDescriptor,
    device_qualifier_desc: DeviceQualifierDescriptor,
    configs: Vec<Configuration>,
    string_descs: Vec<StringDescriptor>,
}

impl VirtualUsbDeviceBuilder {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            device_desc: DeviceDescriptor::new(vendor_id, product_id),
            device_qualifier_desc: DeviceQualifierDescriptor::new(),
            configs: Vec::new(),
            string_descs: Vec::new(),
        }
    }

    pub fn class(mut self, class: DeviceClass) -> Self {
        self.device_desc.b_device_class = class as u8;
        self
    }

    pub fn max_packet_size_0(mut self, size: u8) -> Self {
        self.device_desc.b_max_packet_size_0 = size;
        self
    }

    /// Sets the manufacturer string and its descriptor index
    /// (`iManufacturer`).
    pub fn manufacturer(mut self, text: impl Into<String>) -> Self {
        self.string_descs.push(StringDescriptor::new(text));
        self.device_desc.i_manufacturer = self.string_descs.len() as u8;
        self
    }

    pub fn product(mut self, text: impl Into<String>) -> Self {
        self.string_descs.push(StringDescriptor::new(text));
        self.device_desc.i_product = self.string_descs.len() as u8;
        self
    }

    pub fn serial_number(mut self, text: impl Into<String>) -> Self {
        self.string_descs.push(StringDescriptor::new(text));
        self.device_desc.i_serial_number = self.string_descs.len() as u8;
        self
    }

    pub fn add_configuration(mut self, config: ConfigurationBuilder) -> Self {
        self.configs.push(config.build());
        self.device_desc.b_num_configurations = self.configs.len() as u8;
        self
    }

    pub fn build(self) -> Info {
        Info {
            device_desc: self.device_desc,
            device_qualifier_desc: self.device_qualifier_desc,
            configs: self.configs,
            string_descs: self.string_descs,
        }
    }
}

/// Builds a [`Configuration`]: its descriptor plus an ordered list of
/// interfaces.
pub struct ConfigurationBuilder {
    descriptor: ConfigurationDescriptor,
    interfaces: Vec<Interface>,
}

impl ConfigurationBuilder {
    pub fn new(configuration_value: u8) -> Self {
        Self {
            descriptor: ConfigurationDescriptor::new(configuration_value),
            interfaces: Vec::new(),
        }
    }

    pub fn self_powered(mut self, self_powered: bool) -> Self {
        if self_powered {
            self.descriptor.bm_attributes |= super::SELF_POWERED;
        } else {
            self.descriptor.bm_attributes &= !super::SELF_POWERED;
        }
        self
    }

    /// `bMaxPower` in units of 2 mA, matching the USB descriptor field.
    pub fn max_power_ma(mut self, milliamps: u16) -> Self {
        self.descriptor.b_max_power = (milliamps / 2) as u8;
        self
    }

    pub fn add_interface(mut self, interface: InterfaceBuilder) -> Self {
        self.interfaces.push(interface.build());
        self
    }

    fn build(self) -> Configuration {
        let mut config = Configuration {
            descriptor: self.descriptor,
            interfaces: self.interfaces,
        };
        // Pre-compute wTotalLength/bNumInterfaces once up front so the
        // invariant holds even if the caller never calls serialize().
        let _ = config.serialize();
        config
    }
}

/// Builds an [`Interface`]: its descriptor, any class-specific extra
/// descriptors, and its endpoints.
pub struct InterfaceBuilder {
    descriptor: InterfaceDescriptor,
    extras: Vec<Vec<u8>>,
    endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceBuilder {
    pub fn new(interface_number: u8) -> Self {
        Self {
            descriptor: InterfaceDescriptor::new(interface_number),
            extras: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn class(mut self, class: DeviceClass) -> Self {
        self.descriptor.b_interface_class = class as u8;
        self
    }

    pub fn sub_class(mut self, sub_class: u8) -> Self {
        self.descriptor.b_interface_sub_class = sub_class;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.descriptor.b_interface_protocol = protocol;
        self
    }

    pub fn alternate_setting(mut self, alt: u8) -> Self {
        self.descriptor.b_alternate_setting = alt;
        self
    }

    /// Appends a raw class-specific functional descriptor (e.g. an HID
    /// or CDC descriptor), emitted between the interface descriptor and
    /// its endpoints.
    pub fn add_extra_descriptor(mut self, bytes: Vec<u8>) -> Self {
        self.extras.push(bytes);
        self
    }

    pub fn add_endpoint(mut self, endpoint: EndpointBuilder) -> Self {
        self.endpoints.push(endpoint.build());
        self
    }

    fn build(mut self) -> Interface {
        self.descriptor.b_num_endpoints = self.endpoints.len() as u8;
        Interface {
            descriptor: self.descriptor,
            extras: self.extras,
            endpoints: self.endpoints,
        }
    }
}

/// Builds an [`EndpointDescriptor`] from its logical parts instead of a
/// raw `bEndpointAddress`/`bmAttributes` pair.
pub struct EndpointBuilder {
    number: u8,
    direction: Direction,
    transfer_type: TransferType,
    sync_type: SynchronizationType,
    usage_type: UsageType,
    max_packet_size: u16,
    interval: u8,
}

impl EndpointBuilder {
    pub fn new(number: u8, direction: Direction, transfer_type: TransferType) -> Self {
        Self {
            number,
            direction,
            transfer_type,
            sync_type: SynchronizationType::NoSynchronization,
            usage_type: UsageType::Data,
            max_packet_size: 64,
            interval: 0,
        }
    }

    pub fn synchronization(mut self, sync_type: SynchronizationType) -> Self {
        self.sync_type = sync_type;
        self
    }

    pub fn usage(mut self, usage_type: UsageType) -> Self {
        self.usage_type = usage_type;
        self
    }

    pub fn max_packet_size(mut self, size: u16) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn interval(mut self, interval: u8) -> Self {
        self.interval = interval;
        self
    }

    fn build(self) -> EndpointDescriptor {
        let address = (self.number & 0x0f) | ((self.direction as u8) << 7);
        let attributes = (self.transfer_type as u8)
            | ((self.sync_type as u8) << 2)
            | ((self.usage_type as u8) << 4);
        EndpointDescriptor::new(address, attributes, self.max_packet_size, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_single_interface_device() {
        let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001)
            .manufacturer("Test Vendor")
            .product("Test Device")
            .add_configuration(
                ConfigurationBuilder::new(1).add_interface(
                    InterfaceBuilder::new(0)
                        .class(DeviceClass::VendorSpecific)
                        .add_endpoint(EndpointBuilder::new(
                            1,
                            Direction::In,
                            TransferType::Bulk,
                        ))
                        .add_endpoint(EndpointBuilder::new(
                            1,
                            Direction::Out,
                            TransferType::Bulk,
                        )),
                ),
            )
            .build();

        assert_eq!(info.configs.len(), 1);
        assert_eq!(info.configs[0].interfaces.len(), 1);
        assert_eq!(info.configs[0].interfaces[0].endpoints.len(), 2);
        assert_eq!(info.device_desc.i_manufacturer, 1);
        assert_eq!(info.device_desc.i_product, 2);
    }

    #[test]
    fn endpoint_address_encodes_direction() {
        let ep = EndpointBuilder::new(2, Direction::In, TransferType::Interrupt).build();
        assert_eq!(ep.b_endpoint_address, 0x82);
        assert_eq!(ep.bm_attributes & 0b11, TransferType::Interrupt as u8);
    }
}
