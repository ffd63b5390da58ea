use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{
    Channel, ChannelListener, ChannelRequest, Connection, ConnectionListener, ModuleType,
};
use crate::error::{CastError, Result};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 64 * 1024;
/// Largest negotiation body accepted from a peer.
const MAX_BODY_LEN: usize = 64 * 1024;

struct ListenEntry {
    request: ChannelRequest,
    running: Arc<AtomicBool>,
}

/// TCP [`Connection`]: one stream per channel, one reader thread per stream.
///
/// Sender-role requests bind an ephemeral port and accept exactly one peer;
/// Receiver-role requests connect on a background thread.
#[derive(Default)]
pub struct TcpConnection {
    listening: Mutex<Vec<ListenEntry>>,
}

impl TcpConnection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for TcpConnection {
    fn start_connection(
        &self,
        request: &ChannelRequest,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<()> {
        let host = match request.remote_device.ip_address.as_str() {
            "" => "127.0.0.1",
            ip => ip,
        };
        let addr = (host, request.remote_device.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CastError::InvalidRequest(format!("unresolvable address {host}")))?;
        let request = request.clone();

        thread::spawn(move || match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                tracing::info!(%addr, module = ?request.module_type, "tcp channel connected");
                match TcpChannel::new(request.clone(), stream, listener.clone()) {
                    Ok(channel) => listener.on_connection_opened(channel),
                    Err(e) => {
                        tracing::warn!(%addr, error = %e, "tcp channel setup failed");
                        listener.on_connection_connect_failed(&request, -1);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%addr, module = ?request.module_type, error = %e, "tcp connect failed");
                listener.on_connection_connect_failed(&request, e.raw_os_error().unwrap_or(-1));
            }
        });

        Ok(())
    }

    fn start_listen(
        &self,
        request: &ChannelRequest,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<u16> {
        let host = match request.local_device.ip_address.as_str() {
            "" => "0.0.0.0",
            ip => ip,
        };
        let socket = TcpListener::bind((host, 0))?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();

        let running = Arc::new(AtomicBool::new(true));
        self.listening.lock().push(ListenEntry {
            request: request.clone(),
            running: running.clone(),
        });

        let request = request.clone();
        thread::spawn(move || accept_one(socket, request, listener, running));

        tracing::debug!(port, "tcp channel listening");
        Ok(port)
    }

    fn close_connection(&self, request: &ChannelRequest) {
        self.listening.lock().retain(|entry| {
            let same = entry.request.connection_id == request.connection_id
                && entry.request.module_type == request.module_type
                && entry.request.local_device == request.local_device;
            if same {
                entry.running.store(false, Ordering::SeqCst);
            }
            !same
        });
    }
}

/// Non-blocking accept loop for a single peer.
///
/// Checks `running` between accepts with a 50ms poll interval so that
/// [`TcpConnection::close_connection`] can stop it promptly.
fn accept_one(
    socket: TcpListener,
    request: ChannelRequest,
    listener: Arc<dyn ConnectionListener>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match socket.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                tracing::info!(%peer_addr, module = ?request.module_type, "tcp channel accepted");
                match TcpChannel::new(request.clone(), stream, listener.clone()) {
                    Ok(channel) => listener.on_connection_opened(channel),
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "tcp channel setup failed");
                        listener.on_connection_error(&request, -1);
                    }
                }
                return;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "tcp accept error");
                listener.on_connection_error(&request, e.raw_os_error().unwrap_or(-1));
                return;
            }
        }
    }
    tracing::debug!(module = ?request.module_type, "accept loop exited");
}

struct TcpChannel {
    request: ChannelRequest,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    writer: Mutex<TcpStream>,
    reader: Mutex<Option<TcpStream>>,
    conn_listener: Arc<dyn ConnectionListener>,
    closed: AtomicBool,
    self_ref: Weak<TcpChannel>,
}

impl TcpChannel {
    fn new(
        request: ChannelRequest,
        stream: TcpStream,
        conn_listener: Arc<dyn ConnectionListener>,
    ) -> Result<Arc<Self>> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        Ok(Arc::new_cyclic(|self_ref| TcpChannel {
            request,
            local_addr,
            peer_addr,
            writer: Mutex::new(stream),
            reader: Mutex::new(Some(reader)),
            conn_listener,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    /// Read loop. Returns the reason for exiting.
    fn run(&self, stream: TcpStream, listener: &Arc<dyn ChannelListener>) -> &'static str {
        let mut reader = BufReader::new(stream);
        if self.request.module_type == ModuleType::Rtsp {
            loop {
                match read_message(&mut reader) {
                    Ok(Some(message)) => listener.on_data(&self.request, message.as_bytes()),
                    Ok(None) => return "connection closed by peer",
                    Err(e) => {
                        tracing::debug!(peer = %self.peer_addr, error = %e, "negotiation read failed");
                        return "read error";
                    }
                }
            }
        }

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return "connection closed by peer",
                Ok(n) => listener.on_data(&self.request, &buf[..n]),
                Err(_) => return "read error",
            }
        }
    }
}

/// Read one negotiation message: header block up to the blank line, then
/// `Content-Length` bytes of body.
fn read_message(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<String>> {
    let mut text = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if text.is_empty() && line.trim().is_empty() {
            continue;
        }
        text.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let body_len = text
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if body_len > MAX_BODY_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("negotiation body of {body_len} bytes exceeds {MAX_BODY_LEN}"),
        ));
    }
    if body_len > 0 {
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        text.push_str(&String::from_utf8_lossy(&body));
    }
    Ok(Some(text))
}

impl Channel for TcpChannel {
    fn request(&self) -> &ChannelRequest {
        &self.request
    }

    fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn set_listener(&self, listener: Arc<dyn ChannelListener>) {
        let Some(stream) = self.reader.lock().take() else {
            tracing::warn!(peer = %self.peer_addr, "tcp channel listener already attached");
            return;
        };
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        thread::spawn(move || {
            let reason = this.run(stream, &listener);
            tracing::info!(peer = %this.peer_addr, module = ?this.request.module_type, reason, "tcp channel ended");
            if !this.closed.swap(true, Ordering::SeqCst) {
                this.conn_listener.on_connection_closed(this.clone());
            }
        });
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.writer.lock().shutdown(Shutdown::Both) {
            tracing::debug!(peer = %self.peer_addr, error = %e, "tcp shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelRole, DeviceSnapshot, LinkType};
    use crate::session::SessionProperties;
    use std::sync::mpsc;

    struct Forward(Mutex<mpsc::Sender<String>>);

    impl ConnectionListener for Forward {
        fn on_connection_opened(&self, channel: Arc<dyn Channel>) {
            channel.set_listener(Arc::new(Forward(Mutex::new(self.0.lock().clone()))));
            let _ = self.0.lock().send(format!("opened {}", channel.local_port() > 0));
            if channel.request().role == ChannelRole::Receiver {
                channel
                    .send(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nContent-Length: 2\r\n\r\nhi")
                    .unwrap();
            }
        }
        fn on_connection_connect_failed(&self, _request: &ChannelRequest, _reason: i32) {
            let _ = self.0.lock().send("failed".into());
        }
        fn on_connection_closed(&self, _channel: Arc<dyn Channel>) {
            let _ = self.0.lock().send("closed".into());
        }
        fn on_connection_error(&self, _request: &ChannelRequest, _code: i32) {}
    }

    impl ChannelListener for Forward {
        fn on_data(&self, _request: &ChannelRequest, data: &[u8]) {
            let _ = self.0.lock().send(String::from_utf8_lossy(data).into_owned());
        }
    }

    fn request(role: ChannelRole, port: u16) -> ChannelRequest {
        ChannelRequest::new(
            ModuleType::Rtsp,
            LinkType::Tcp,
            role,
            DeviceSnapshot {
                device_id: "a".into(),
                ip_address: "127.0.0.1".into(),
                port: 0,
            },
            DeviceSnapshot {
                device_id: "b".into(),
                ip_address: "127.0.0.1".into(),
                port,
            },
            SessionProperties::default(),
        )
    }

    #[test]
    fn loopback_frames_rtsp_messages() {
        let conn = TcpConnection::new();
        let (tx, rx) = mpsc::channel();
        let listener: Arc<dyn ConnectionListener> = Arc::new(Forward(Mutex::new(tx)));

        let port = conn
            .start_listen(&request(ChannelRole::Sender, 0), listener.clone())
            .unwrap();
        conn.start_connection(&request(ChannelRole::Receiver, port), listener)
            .unwrap();

        let timeout = Duration::from_secs(5);
        let mut seen = Vec::new();
        while seen.len() < 3 {
            seen.push(rx.recv_timeout(timeout).unwrap());
        }
        assert_eq!(seen.iter().filter(|e| e.as_str() == "opened true").count(), 2);
        let message = seen.iter().find(|e| e.starts_with("OPTIONS")).unwrap();
        assert!(message.ends_with("\r\n\r\nhi"));
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(socket.local_addr().unwrap()).unwrap();
        let (server, _) = socket.accept().unwrap();
        (client, server)
    }

    #[test]
    fn oversized_body_is_rejected() {
        let (mut client, server) = loopback_pair();
        client
            .write_all(b"PLAY * RTSP/1.0\r\nCSeq: 1\r\nContent-Length: 18446744073709551615\r\n\r\nx")
            .unwrap();

        let err = read_message(&mut BufReader::new(server)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_body_closes_the_channel() {
        let (mut client, server) = loopback_pair();
        let (tx, rx) = mpsc::channel();
        let forward = Arc::new(Forward(Mutex::new(tx)));
        let channel = TcpChannel::new(request(ChannelRole::Sender, 0), server, forward.clone()).unwrap();
        channel.set_listener(forward);

        let oversized = format!("PLAY * RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n", MAX_BODY_LEN + 1);
        client.write_all(oversized.as_bytes()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "closed");
    }
}
