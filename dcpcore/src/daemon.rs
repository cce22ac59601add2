// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The long-running encode server (spec §4.5): accepts encode requests,
//! runs its own fixed-size local worker pool, answers discovery probes, and
//! periodically broadcasts its own availability.

use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::error::CoreError;
use crate::j2k::CinemaProfileEncoder;
use crate::local_worker::encode_local;
use crate::model::{PixelPlanes, PreparedFrame, ServerDescription};
use crate::socket::{Socket, read_nul_terminated};
use crate::wire::{
    DISCOVERY_HELLO, EncodeRequest, ServerAvailable, colour_conversion_from_json, error_reply,
    protocol_error_reply,
};

/// Interval for discovery announcements, shared with the client side (spec
/// §4.5, §5).
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline applied to each one-shot encode connection handled by the
/// daemon.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(20);

/// The running daemon: a fixed worker pool plus the three background
/// threads described by spec §4.5.
pub struct Daemon {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Starts accepting encode requests on `port_base`, probes on
    /// `port_base + 1`, with `worker_threads` workers and `j2k_bandwidth`
    /// bits/second budget, advertised as `description`.
    ///
    /// # Errors
    /// * Either TCP listener fails to bind.
    pub fn start(
        port_base: u16,
        worker_threads: u32,
        j2k_bandwidth: u64,
        protocol_version: u32,
        description: ServerDescription,
    ) -> Result<Self, CoreError> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        let request_listener = TcpListener::bind(("0.0.0.0", port_base)).map_err(CoreError::WriteIo)?;
        request_listener
            .set_nonblocking(true)
            .map_err(CoreError::WriteIo)?;

        let (job_tx, job_rx): (Sender<TcpStream>, Receiver<TcpStream>) = channel();
        let job_rx = Arc::new(std::sync::Mutex::new(job_rx));

        for worker_index in 0..worker_threads.max(1) {
            let job_rx = Arc::clone(&job_rx);
            let stop = Arc::clone(&stop);
            handles.push(thread::spawn(move || {
                worker_loop(worker_index, &job_rx, j2k_bandwidth, protocol_version, &stop);
            }));
        }

        {
            let stop = Arc::clone(&stop);
            handles.push(thread::spawn(move || {
                accept_loop(request_listener, &job_tx, &stop);
            }));
        }

        let probe_socket =
            UdpSocket::bind(("0.0.0.0", port_base + 1)).map_err(CoreError::WriteIo)?;
        probe_socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .map_err(CoreError::WriteIo)?;
        {
            let stop = Arc::clone(&stop);
            let description = description.clone();
            handles.push(thread::spawn(move || {
                probe_responder_loop(probe_socket, port_base, protocol_version, &description, &stop);
            }));
        }

        {
            let stop = Arc::clone(&stop);
            handles.push(thread::spawn(move || {
                announce_loop(port_base, protocol_version, &description, &stop);
            }));
        }

        Ok(Self { stop, handles })
    }

    /// Signals every background thread to stop and waits for them to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, job_tx: &Sender<TcpStream>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                trace!(%addr, "accepted encode connection");
                if job_tx.send(stream).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                error!(?err, "encode acceptor failed");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn worker_loop(
    worker_index: u32,
    job_rx: &Arc<std::sync::Mutex<Receiver<TcpStream>>>,
    j2k_bandwidth: u64,
    protocol_version: u32,
    stop: &AtomicBool,
) {
    let encoder = CinemaProfileEncoder::new();
    while !stop.load(Ordering::SeqCst) {
        let stream = {
            let guard = job_rx.lock().expect("job queue mutex poisoned");
            guard.recv_timeout(Duration::from_millis(200))
        };
        let Ok(stream) = stream else {
            continue;
        };
        if let Err(err) = handle_request(stream, &encoder, j2k_bandwidth, protocol_version) {
            error!(worker_index, ?err, "encode request failed");
        }
    }
}

fn handle_request(
    stream: TcpStream,
    encoder: &CinemaProfileEncoder,
    j2k_bandwidth: u64,
    protocol_version: u32,
) -> Result<(), CoreError> {
    let mut socket = Socket::from_stream(stream, REQUEST_DEADLINE);

    let metadata_bytes = socket.read_frame().map_err(CoreError::Transport)?;
    let metadata = read_nul_terminated(&metadata_bytes).map_err(CoreError::Transport)?;
    let request = match EncodeRequest::from_metadata_line(&metadata) {
        Ok(request) => request,
        Err(err) => {
            let _ = socket.write_frame(&error_reply(&err.to_string()));
            return Err(err);
        }
    };

    if request.version != protocol_version {
        let message = format!(
            "server speaks protocol version {protocol_version}, request carried version {}",
            request.version
        );
        let _ = socket.write_frame(&protocol_error_reply(&message));
        return Err(CoreError::Protocol(message));
    }

    let plane_count = request.pixel_format.plane_count();
    let mut plane_bytes = Vec::with_capacity(plane_count);
    let mut strides = Vec::with_capacity(plane_count);
    for plane_index in 0..plane_count {
        let bpp = request.pixel_format.bytes_per_pixel(plane_index);
        let stride = request.width as usize * bpp;
        let bytes = socket
            .read(stride * request.height as usize)
            .map_err(CoreError::Transport)?;
        strides.push(stride);
        plane_bytes.push(bytes);
    }

    let planes = PixelPlanes::builder()
        .format(request.pixel_format)
        .width(request.width)
        .height(request.height)
        .strides(strides)
        .planes(plane_bytes)
        .build();

    if let Err(err) = planes.validate() {
        let _ = socket.write_frame(&error_reply(&err.to_string()));
        return Err(err);
    }

    let colour_conversion = match colour_conversion_from_json(&request.colour_conversion_json) {
        Ok(colour_conversion) => colour_conversion,
        Err(err) => {
            let _ = socket.write_frame(&error_reply(&err.to_string()));
            return Err(err);
        }
    };

    let frame = PreparedFrame::builder()
        .planes(planes)
        .eye(request.eye)
        .resolution(request.resolution)
        .maybe_colour_conversion(colour_conversion)
        .build();

    match encode_local(encoder, request.index, &frame, j2k_bandwidth, request.fps) {
        Ok(encoded) => {
            socket
                .write_frame(encoded.data())
                .map_err(CoreError::Transport)?;
            debug!(index = request.index, "handled remote encode request");
            Ok(())
        }
        Err(err) => {
            let _ = socket.write_frame(&error_reply(&err.to_string()));
            Err(err)
        }
    }
}

/// Receives discovery hello probes on the broadcast socket and answers each
/// by opening a fresh TCP connection back to the prober's address, carrying
/// this server's description (spec §4.5 step 1).
fn probe_responder_loop(
    socket: UdpSocket,
    port_base: u16,
    protocol_version: u32,
    description: &ServerDescription,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((_len, sender)) => {
                respond_to_prober(sender.ip(), port_base, protocol_version, description);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                error!(?err, "probe responder recv failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn respond_to_prober(
    prober: std::net::IpAddr,
    port_base: u16,
    protocol_version: u32,
    description: &ServerDescription,
) {
    match TcpStream::connect((prober, port_base + 1)) {
        Ok(stream) => {
            let mut socket = Socket::from_stream(stream, Duration::from_secs(5));
            let doc = ServerAvailable {
                version: protocol_version,
                host: description.host().clone(),
                port: port_base,
                threads: description.thread_count(),
            };
            let _ = socket.write_frame(doc.to_xml().as_bytes());
        }
        Err(err) => trace!(?err, %prober, "could not connect back to discovery prober"),
    }
}

/// Periodically re-announces this server's description to the broadcast
/// address, so a client that starts after the initial probe round-trip
/// still learns of it (spec §4.5 step 2).
fn announce_loop(
    port_base: u16,
    protocol_version: u32,
    description: &ServerDescription,
    stop: &AtomicBool,
) {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        error!("announce loop failed to bind UDP socket");
        return;
    };
    let _ = socket.set_broadcast(true);

    while !stop.load(Ordering::SeqCst) {
        let _ = socket.send_to(DISCOVERY_HELLO.as_bytes(), ("255.255.255.255", port_base + 1));
        info!(host = description.host(), protocol_version, "announced availability");
        thread::sleep(ANNOUNCE_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::Daemon;
    use crate::model::ServerDescription;
    use crate::socket::{Socket, nul_terminate};
    use crate::wire::EncodeRequest;
    use crate::model::{Eye, PixelFormat, Resolution};

    fn free_port_pair() -> u16 {
        // Reserve two adjacent ports by binding a listener, reading its
        // ephemeral port, then releasing it; the daemon rebinds both.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[test]
    fn daemon_answers_one_shot_encode_request() {
        let port_base = free_port_pair();
        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(port_base)
            .thread_count(1)
            .build();
        let mut daemon = Daemon::start(port_base, 1, 250_000_000, 1, description).unwrap();
        thread::sleep(Duration::from_millis(100));

        let request = EncodeRequest {
            version: 1,
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgb24,
            out_width: 2,
            out_height: 2,
            eye: Eye::Mono,
            index: 5,
            fps: 24,
            colour_conversion_json: "null".to_string(),
            j2k_bandwidth: 250_000_000,
            resolution: Resolution::TwoK,
        };
        let mut socket =
            Socket::connect(("127.0.0.1", port_base), Duration::from_secs(5)).unwrap();
        socket
            .write_frame(&nul_terminate(&request.to_metadata_line()))
            .unwrap();
        socket.write(&[10u8; 12]).unwrap();
        let reply = socket.read_frame().unwrap();
        assert!(!reply.is_empty());

        daemon.stop();
    }

    #[test]
    fn remote_reply_matches_local_encode_byte_for_byte() {
        use crate::j2k::CinemaProfileEncoder;
        use crate::local_worker::encode_local;
        use crate::model::{PixelPlanes, PreparedFrame};

        let plane = vec![10u8; 12];

        let planes = PixelPlanes::builder()
            .format(PixelFormat::Rgb24)
            .width(2)
            .height(2)
            .strides(vec![6])
            .planes(vec![plane.clone()])
            .build();
        let frame = PreparedFrame::builder()
            .planes(planes)
            .eye(Eye::Mono)
            .resolution(Resolution::TwoK)
            .build();
        let local = encode_local(&CinemaProfileEncoder::new(), 5, &frame, 250_000_000, 24).unwrap();

        let port_base = free_port_pair();
        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(port_base)
            .thread_count(1)
            .build();
        let mut daemon = Daemon::start(port_base, 1, 250_000_000, 1, description).unwrap();
        thread::sleep(Duration::from_millis(100));

        let request = EncodeRequest {
            version: 1,
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgb24,
            out_width: 2,
            out_height: 2,
            eye: Eye::Mono,
            index: 5,
            fps: 24,
            colour_conversion_json: "null".to_string(),
            j2k_bandwidth: 250_000_000,
            resolution: Resolution::TwoK,
        };
        let mut socket =
            Socket::connect(("127.0.0.1", port_base), Duration::from_secs(5)).unwrap();
        socket
            .write_frame(&nul_terminate(&request.to_metadata_line()))
            .unwrap();
        socket.write(&plane).unwrap();
        let remote = socket.read_frame().unwrap();

        assert_eq!(remote, local.data().clone());

        daemon.stop();
    }

    #[test]
    fn handle_request_rejects_protocol_version_mismatch() {
        let port_base = free_port_pair();
        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(port_base)
            .thread_count(1)
            .build();
        let mut daemon = Daemon::start(port_base, 1, 250_000_000, 1, description).unwrap();
        thread::sleep(Duration::from_millis(100));

        let request = EncodeRequest {
            version: 2,
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgb24,
            out_width: 2,
            out_height: 2,
            eye: Eye::Mono,
            index: 5,
            fps: 24,
            colour_conversion_json: "null".to_string(),
            j2k_bandwidth: 250_000_000,
            resolution: Resolution::TwoK,
        };
        let mut socket =
            Socket::connect(("127.0.0.1", port_base), Duration::from_secs(5)).unwrap();
        socket
            .write_frame(&nul_terminate(&request.to_metadata_line()))
            .unwrap();
        socket.write(&[10u8; 12]).unwrap();
        let reply = socket.read_frame().unwrap();
        assert!(crate::wire::as_protocol_error_reply(&reply).is_some());

        daemon.stop();
    }

    #[test]
    fn remote_reply_applies_colour_conversion_like_local_encode() {
        use crate::colour::convert_to_xyz;
        use crate::j2k::CinemaProfileEncoder;
        use crate::local_worker::encode_local;
        use crate::model::{ColourConversion, GammaCurve, PixelPlanes, PreparedFrame};
        use crate::wire::colour_conversion_to_json;

        let plane = vec![10u8; 12];
        let conversion = ColourConversion {
            input_gamma: GammaCurve::pure_power(2.6),
            linearized: false,
            rgb_to_xyz: [[0.4124, 0.3576, 0.1805], [0.2126, 0.7152, 0.0722], [0.0193, 0.1192, 0.9505]],
            output_gamma: GammaCurve::pure_power(2.6),
        };

        let planes = PixelPlanes::builder()
            .format(PixelFormat::Rgb24)
            .width(2)
            .height(2)
            .strides(vec![6])
            .planes(vec![plane.clone()])
            .build();
        let frame = PreparedFrame::builder()
            .planes(planes)
            .eye(Eye::Mono)
            .resolution(Resolution::TwoK)
            .colour_conversion(conversion)
            .build();
        assert!(!convert_to_xyz(frame.planes(), frame.colour_conversion()).samples().is_empty());
        let local = encode_local(&CinemaProfileEncoder::new(), 5, &frame, 250_000_000, 24).unwrap();

        let port_base = free_port_pair();
        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(port_base)
            .thread_count(1)
            .build();
        let mut daemon = Daemon::start(port_base, 1, 250_000_000, 1, description).unwrap();
        thread::sleep(Duration::from_millis(100));

        let request = EncodeRequest {
            version: 1,
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgb24,
            out_width: 2,
            out_height: 2,
            eye: Eye::Mono,
            index: 5,
            fps: 24,
            colour_conversion_json: colour_conversion_to_json(Some(&conversion)),
            j2k_bandwidth: 250_000_000,
            resolution: Resolution::TwoK,
        };
        let mut socket =
            Socket::connect(("127.0.0.1", port_base), Duration::from_secs(5)).unwrap();
        socket
            .write_frame(&nul_terminate(&request.to_metadata_line()))
            .unwrap();
        socket.write(&plane).unwrap();
        let remote = socket.read_frame().unwrap();

        assert_eq!(remote, local.data().clone());

        daemon.stop();
    }
}
