use std::{env, thread, time::Duration};

use acqlink::{DeviceLink, DispatchPolicy, LinkHandlers, ports};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let known = ports::usb_serial_ports();
    println!("usb serial ports: {known:?}");

    let Some(port) = env::args().nth(1).or_else(|| known.first().cloned()) else {
        eprintln!("usage: acqlink <port>");
        return Ok(());
    };

    let handlers = LinkHandlers::default()
        .on_consumer(|event| println!("{event:?}"))
        .on_state(|state| println!("handshake: {state}"))
        .on_error(|err| eprintln!("error: {err}"));

    let link = DeviceLink::new(DispatchPolicy::Queued, handlers);
    link.open(&port)?;

    thread::sleep(Duration::from_secs(30));
    link.close();
    Ok(())
}
