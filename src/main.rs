use usbip_server::device::VirtualUsbDevice;
use usbip_server::server::{Server, DEFAULT_PORT};
use usbip_server::usb::{
    ConfigurationBuilder, Direction, EndpointBuilder, InterfaceBuilder, TransferType,
    VirtualUsbDeviceBuilder,
};

fn main() {
    use simple_logger::SimpleLogger;
    SimpleLogger::new().init().unwrap();

    let info = VirtualUsbDeviceBuilder::new(0x1209, 0x0001)
        .manufacturer("virtual-usb-rs")
        .product("Generic Bulk Device")
        .add_configuration(
            ConfigurationBuilder::new(1).add_interface(
                InterfaceBuilder::new(0)
                    .add_endpoint(EndpointBuilder::new(1, Direction::In, TransferType::Bulk))
                    .add_endpoint(EndpointBuilder::new(1, Direction::Out, TransferType::Bulk)),
            ),
        )
        .build();
    let device = VirtualUsbDevice::new(
        info,
        "/sys/devices/pci0000:00/0000:00:01.2/usb1/1-1",
        "1-1",
    );

    let addr = ("0.0.0.0", DEFAULT_PORT);
    let server = match Server::bind(addr, vec![device]) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to bind {}:{}: {e}", addr.0, addr.1);
            return;
        }
    };
    log::info!("usbip-server listening on {:?}", server.local_addr());

    if let Err(e) = server.run() {
        log::error!("server stopped: {e}");
    }
}
