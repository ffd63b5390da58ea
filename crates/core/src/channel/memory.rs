//! In-process link between two sessions.
//!
//! One [`MemoryConnection`] plays the role of the network: register the same
//! instance in both sessions' [`ConnectionRegistry`](super::ConnectionRegistry)
//! and a Sender-role `start_listen` on one side is paired with the
//! Receiver-role `start_connection` on the other by port number. Data is
//! delivered synchronously on the sending thread.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::{Channel, ChannelListener, ChannelRequest, Connection, ConnectionListener};
use crate::error::Result;

const MEMORY_PORT_MIN: u16 = 6000;

/// Reason reported when nothing listens on the requested port.
pub const CONNECT_REFUSED: i32 = -111;

struct Listening {
    request: ChannelRequest,
    listener: Arc<dyn ConnectionListener>,
}

#[derive(Default)]
struct Hub {
    listening: HashMap<u16, Listening>,
    next_port: u16,
}

/// In-process [`Connection`] pairing listeners and connectors by port.
#[derive(Default)]
pub struct MemoryConnection {
    hub: Mutex<Hub>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_port(hub: &mut Hub) -> u16 {
        loop {
            if hub.next_port < MEMORY_PORT_MIN {
                hub.next_port = MEMORY_PORT_MIN;
            }
            let port = hub.next_port;
            hub.next_port = hub.next_port.wrapping_add(1);
            if !hub.listening.contains_key(&port) {
                return port;
            }
        }
    }
}

impl Connection for MemoryConnection {
    fn start_connection(
        &self,
        request: &ChannelRequest,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<()> {
        let port = request.remote_device.port;
        let peer = self.hub.lock().listening.remove(&port);
        let Some(peer) = peer else {
            tracing::warn!(port, module = ?request.module_type, "nothing listening on memory port");
            listener.on_connection_connect_failed(request, CONNECT_REFUSED);
            return Ok(());
        };

        let accepted = MemoryChannel::new(peer.request, port, peer.listener.clone());
        let connected = MemoryChannel::new(request.clone(), 0, listener.clone());
        *accepted.peer.lock() = Arc::downgrade(&connected);
        *connected.peer.lock() = Arc::downgrade(&accepted);

        tracing::debug!(port, module = ?request.module_type, "memory link paired");
        peer.listener.on_connection_opened(accepted);
        listener.on_connection_opened(connected);
        Ok(())
    }

    fn start_listen(
        &self,
        request: &ChannelRequest,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<u16> {
        let mut hub = self.hub.lock();
        let port = Self::allocate_port(&mut hub);
        hub.listening.insert(
            port,
            Listening {
                request: request.clone(),
                listener,
            },
        );
        Ok(port)
    }

    fn close_connection(&self, request: &ChannelRequest) {
        self.hub.lock().listening.retain(|_, l| {
            !(l.request.connection_id == request.connection_id && same_owner(&l.request, request))
        });
    }
}

fn same_owner(a: &ChannelRequest, b: &ChannelRequest) -> bool {
    a.module_type == b.module_type && a.local_device == b.local_device
}

#[derive(Default)]
struct Inbox {
    listener: Option<Arc<dyn ChannelListener>>,
    pending: VecDeque<Vec<u8>>,
}

/// One end of a memory link.
struct MemoryChannel {
    request: ChannelRequest,
    port: u16,
    peer: Mutex<Weak<MemoryChannel>>,
    inbox: Mutex<Inbox>,
    /// Serializes delivery so buffered data keeps its order.
    delivery: Mutex<()>,
    conn_listener: Arc<dyn ConnectionListener>,
    closed: AtomicBool,
    self_ref: Weak<MemoryChannel>,
}

impl MemoryChannel {
    fn new(
        request: ChannelRequest,
        port: u16,
        conn_listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| MemoryChannel {
            request,
            port,
            peer: Mutex::new(Weak::new()),
            inbox: Mutex::new(Inbox::default()),
            delivery: Mutex::new(()),
            conn_listener,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    fn deliver(&self, data: &[u8]) {
        let _order = self.delivery.lock();
        let listener = {
            let mut inbox = self.inbox.lock();
            match inbox.listener.clone() {
                Some(listener) => listener,
                None => {
                    inbox.pending.push_back(data.to_vec());
                    return;
                }
            }
        };
        listener.on_data(&self.request, data);
    }

    fn on_peer_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(this) = self.self_ref.upgrade() {
            self.conn_listener.on_connection_closed(this);
        }
    }
}

impl Channel for MemoryChannel {
    fn request(&self) -> &ChannelRequest {
        &self.request
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        let peer = self.peer.lock().upgrade();
        match peer {
            Some(peer) if !peer.closed.load(Ordering::SeqCst) => {
                peer.deliver(data);
                Ok(())
            }
            _ => Err(io::Error::from(io::ErrorKind::BrokenPipe).into()),
        }
    }

    fn set_listener(&self, listener: Arc<dyn ChannelListener>) {
        let _order = self.delivery.lock();
        let pending = {
            let mut inbox = self.inbox.lock();
            inbox.listener = Some(listener.clone());
            std::mem::take(&mut inbox.pending)
        };
        for data in pending {
            listener.on_data(&self.request, &data);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = std::mem::take(&mut *self.peer.lock()).upgrade();
        if let Some(peer) = peer {
            peer.on_peer_closed();
        }
    }
}
