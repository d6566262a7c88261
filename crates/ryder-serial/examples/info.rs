//! Query a Ryder device for its firmware info.
//!
//! Usage: `cargo run --example info [port]`
//!
//! Without an argument the first enumerated Ryder device is used. A
//! `tcp://host:port` argument connects to a simulator instead.

use std::time::Duration;

use ryder_serial::{serial, Command, DeviceEvent, DriverConfig, RyderSerial};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ryder_serial=debug".into()),
        )
        .init();

    let port = match std::env::args().nth(1) {
        Some(port) => port,
        None => match serial::ryder_ports().into_iter().next() {
            Some(info) => info.name,
            None => {
                eprintln!("no Ryder device found");
                std::process::exit(1);
            }
        },
    };
    println!("using port {port}");

    let ryder = RyderSerial::new(
        port,
        DriverConfig {
            debug: true,
            ..DriverConfig::default()
        },
    );
    let events = ryder.subscribe();
    ryder.open();

    match events.recv_timeout(Duration::from_secs(5)) {
        Ok(DeviceEvent::Open) => {}
        other => {
            eprintln!("could not open port: {other:?}");
            std::process::exit(1);
        }
    }

    match ryder.send(Command::Info).wait() {
        Ok(response) => println!("info response: {response:?}"),
        Err(e) => eprintln!("info failed: {e}"),
    }

    ryder.close();
}
