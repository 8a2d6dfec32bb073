use std::time::Duration;

use rdp::{Event, Socket};

/// Connects to `echo_server`, writes a short message, waits for it to be
/// echoed back, then closes the connection and waits for the peer's FIN.
fn main() {
    env_logger::init();

    let mut socket = Socket::bind("127.0.0.1:0").expect("failed to bind UDP socket");
    let handle = socket
        .net_connect("127.0.0.1:9000")
        .expect("failed to resolve server address");

    let message = b"hello from the rdp echo client";
    let mut buf = vec![0u8; 65536];
    let mut connected = false;
    let mut sent = false;
    let mut received = Vec::new();
    let mut closed = false;

    loop {
        let (_handle, events, result) = socket.read_poll(&mut buf);

        if events.contains(Event::CONNECTED) {
            connected = true;
            println!(">>> connected");
        }

        if events.contains(Event::DATA) {
            match result {
                Ok(0) => {
                    println!(">>> server closed the connection");
                    break;
                }
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if received.len() >= message.len() {
                        println!(">>> echoed back: {:?}", String::from_utf8_lossy(&received));
                        if !closed {
                            socket.conn_close(handle).expect("close failed");
                            closed = true;
                        }
                    }
                }
                Err(e) => eprintln!(">>> read error: {e}"),
            }
        }

        if connected && !sent {
            match socket.write(handle, message) {
                Ok(_) => sent = true,
                Err(e) => eprintln!(">>> write not ready yet: {e}"),
            }
        }

        if events == Event::AGAIN {
            let wait_ms = socket.interval_action();
            std::thread::sleep(Duration::from_millis(wait_ms.min(50)));
        }
    }
}
