// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! UDP broadcast + TCP listen discovery of remote workers (spec §4.4).
//!
//! Two independent threads, started by [`ServerFinder::start`]: a
//! broadcaster that periodically announces a hello datagram, and a listener
//! that accepts one connection per server-availability document and emits a
//! `ServerFound` event through a channel subscription, replacing the
//! original signal/slot dispatch (spec §9).

use std::net::{TcpListener, UdpSocket};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{trace, warn};

use crate::model::ServerDescription;
use crate::socket::Socket;
use crate::wire::{DISCOVERY_HELLO, ServerAvailable};

/// Interval between broadcast announcements and explicit-host probes (spec
/// §4.4, §5).
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Event emitted once per newly-discovered server (spec §4.4).
#[derive(Clone, Debug, PartialEq)]
pub struct ServerFound(pub ServerDescription);

/// Runs the two discovery threads and tracks already-known servers so
/// duplicate announcements are idempotent (spec §8).
pub struct ServerFinder {
    known: Arc<Mutex<Vec<ServerDescription>>>,
    events: Sender<ServerFound>,
    broadcaster: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl ServerFinder {
    /// Starts the broadcaster and listener threads.
    ///
    /// `use_any_servers` suppresses the broadcast half but not the explicit-
    /// host probing or the listener (spec §4.4).
    #[must_use]
    pub fn start(
        port_base: u16,
        use_any_servers: bool,
        explicit_servers: Vec<String>,
    ) -> (Self, Receiver<ServerFound>) {
        let (tx, rx) = channel();
        let known = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let broadcaster = {
            let stop = Arc::clone(&stop);
            Some(thread::spawn(move || {
                broadcaster_loop(port_base, use_any_servers, explicit_servers, &stop);
            }))
        };

        let listener = {
            let known = Arc::clone(&known);
            let tx = tx.clone();
            let stop = Arc::clone(&stop);
            Some(thread::spawn(move || {
                listener_loop(port_base, &known, &tx, &stop);
            }))
        };

        (
            Self {
                known,
                events: tx,
                broadcaster,
                listener,
                stop,
            },
            rx,
        )
    }

    /// Signals both threads to stop and waits for them to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.broadcaster.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }

    /// Snapshot of currently-known servers.
    #[must_use]
    pub fn known_servers(&self) -> Vec<ServerDescription> {
        self.known.lock().expect("known-server mutex poisoned").clone()
    }

    /// A second `ServerFound` subscription that is immediately caught up
    /// with servers already known, for a caller that attaches after
    /// [`ServerFinder::start`] has been running for a while.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ServerFound> {
        let (tx, rx) = channel();
        for server in self.known_servers() {
            let _ = tx.send(ServerFound(server));
        }
        rx
    }
}

impl Drop for ServerFinder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn broadcaster_loop(
    port_base: u16,
    use_any_servers: bool,
    explicit_servers: Vec<String>,
    stop: &std::sync::atomic::AtomicBool,
) {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        warn!("discovery broadcaster failed to bind UDP socket");
        return;
    };
    let _ = socket.set_broadcast(true);
    let payload = format!("{DISCOVERY_HELLO}\0");
    let discovery_port = port_base + 1;

    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
        if use_any_servers {
            let _ = socket.send_to(payload.as_bytes(), ("255.255.255.255", discovery_port));
        }
        for host in &explicit_servers {
            let _ = socket.send_to(payload.as_bytes(), (host.as_str(), discovery_port));
        }
        thread::sleep(PROBE_INTERVAL);
    }
}

fn listener_loop(
    port_base: u16,
    known: &Arc<Mutex<Vec<ServerDescription>>>,
    events: &Sender<ServerFound>,
    stop: &std::sync::atomic::AtomicBool,
) {
    let discovery_port = port_base + 1;
    let Ok(listener) = TcpListener::bind(("0.0.0.0", discovery_port)) else {
        warn!(discovery_port, "discovery listener failed to bind TCP socket");
        return;
    };
    let _ = listener.set_nonblocking(true);

    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let mut socket = Socket::from_stream(stream, Duration::from_secs(5));
                match socket.read_frame() {
                    Ok(body) => match std::str::from_utf8(&body).ok().and_then(|xml| {
                        ServerAvailable::from_xml(xml).ok()
                    }) {
                        Some(doc) => {
                            let description = ServerDescription::builder()
                                .host(doc.host)
                                .port(doc.port)
                                .thread_count(doc.threads)
                                .build();
                            record_if_new(known, events, description);
                        }
                        None => trace!("discarding unparseable discovery document"),
                    },
                    Err(err) => trace!(?err, "discovery listener read failed"),
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                warn!(?err, "discovery listener accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn record_if_new(
    known: &Arc<Mutex<Vec<ServerDescription>>>,
    events: &Sender<ServerFound>,
    description: ServerDescription,
) {
    let mut guard = known.lock().expect("known-server mutex poisoned");
    if guard.iter().any(|s| s.host() == description.host() && s.port() == description.port()) {
        return;
    }
    guard.push(description.clone());
    drop(guard);
    let _ = events.send(ServerFound(description));
}

#[cfg(test)]
mod tests {
    use super::record_if_new;
    use crate::model::ServerDescription;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};

    fn description(port: u16) -> ServerDescription {
        ServerDescription::builder()
            .host("10.0.0.1".to_string())
            .port(port)
            .thread_count(4)
            .build()
    }

    #[test]
    fn duplicate_announcement_emits_once() {
        let known = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel();
        record_if_new(&known, &tx, description(6192));
        record_if_new(&known, &tx, description(6192));
        drop(tx);
        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn distinct_hosts_both_emit() {
        let known = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel();
        record_if_new(&known, &tx, description(6192));
        record_if_new(&known, &tx, description(6193));
        drop(tx);
        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 2);
    }
}
