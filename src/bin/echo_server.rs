use std::collections::HashMap;
use std::time::Duration;

use rdp::{ConnHandle, Event, Socket};

/// Drives one `Socket` bound to a fixed port, echoing back every byte it
/// receives on every connection that connects to it. Demonstrates the
/// caller-owned event loop spec.md leaves out of scope: `read_poll` until
/// it reports `Again`, then `interval_action`, then sleep until the next
/// deadline or readability.
fn main() {
    env_logger::init();

    let mut socket = Socket::bind("127.0.0.1:9000").expect("failed to bind UDP socket");
    println!(">>> listening on {}", socket.local_addr().unwrap());

    let mut buf = vec![0u8; 65536];
    let mut peers: HashMap<ConnHandle, usize> = HashMap::new();

    loop {
        let (handle, events, result) = socket.read_poll(&mut buf);

        if let Some(handle) = handle {
            if events.contains(Event::ACCEPT) {
                peers.entry(handle).or_insert(0);
                println!(">>> accepted a new connection");
            }

            if events.contains(Event::DATA) {
                match result {
                    Ok(0) => {
                        println!(">>> peer sent EOF, closing");
                        let _ = socket.conn_close(handle);
                        peers.remove(&handle);
                    }
                    Ok(n) => {
                        *peers.entry(handle).or_insert(0) += n;
                        let _ = socket.write(handle, &buf[..n]);
                    }
                    Err(e) => eprintln!(">>> read error: {e}"),
                }
            }

            if events.contains(Event::ERROR) {
                if let Err(e) = result {
                    eprintln!(">>> protocol error: {e}");
                }
            }
        }

        if events == Event::AGAIN {
            let wait_ms = socket.interval_action();
            std::thread::sleep(Duration::from_millis(wait_ms.min(50)));
        }
    }
}
