//! In-process socket doubles for protocol tests: a multicast hub with scriptable datagram
//! loss, and a collecting socket for driving the protocol state directly.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::DatagramSocket;

type DropFilter = Box<dyn FnMut(usize, &[u8]) -> bool + Send>;

/// An in-process multicast group. Every socket's sends are delivered to all *other*
/// sockets (multicast loopback off), subject to an optional drop filter. All sent
/// datagrams are logged before filtering.
pub struct Hub {
    state: Mutex<HubState>,
}

struct HubState {
    peers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    filter: Option<DropFilter>,
    log: Vec<Vec<u8>>,
}

impl Hub {
    pub fn new() -> Arc<Hub> {
        Arc::new(Hub {
            state: Mutex::new(HubState {
                peers: Vec::new(),
                filter: None,
                log: Vec::new(),
            }),
        })
    }

    pub fn socket(self: &Arc<Hub>) -> Arc<HubSocket> {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = {
            let mut state = self.state.lock().unwrap();
            state.peers.push(tx);
            state.peers.len() - 1
        };
        Arc::new(HubSocket {
            hub: self.clone(),
            index,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Installs a filter deciding per (sender index, datagram) whether to DROP the
    /// datagram on the wire.
    pub fn set_filter(&self, filter: impl FnMut(usize, &[u8]) -> bool + Send + 'static) {
        self.state.lock().unwrap().filter = Some(Box::new(filter));
    }

    /// All datagrams ever sent through the hub, including dropped ones.
    pub fn log(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().log.clone()
    }

    fn broadcast(&self, from: usize, datagram: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.log.push(datagram.to_vec());

        if let Some(filter) = state.filter.as_mut() {
            if filter(from, datagram) {
                return;
            }
        }
        for (index, peer) in state.peers.iter().enumerate() {
            if index != from {
                let _ = peer.send(datagram.to_vec());
            }
        }
    }
}

pub struct HubSocket {
    hub: Arc<Hub>,
    index: usize,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl DatagramSocket for HubSocket {
    async fn send(&self, datagram: &[u8]) {
        self.hub.broadcast(self.index, datagram);
    }

    async fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            // the hub never closes; park forever
            None => std::future::pending::<io::Result<usize>>().await,
        }
    }
}

/// A socket that records everything sent and delivers nothing, for driving the protocol
/// state machine directly in unit tests.
#[derive(Default)]
pub struct CollectingSocket {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl CollectingSocket {
    pub fn new() -> Arc<CollectingSocket> {
        Arc::new(CollectingSocket::default())
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[async_trait]
impl DatagramSocket for CollectingSocket {
    async fn send(&self, datagram: &[u8]) {
        self.sent.lock().unwrap().push(datagram.to_vec());
    }

    async fn recv_into(&self, _buf: &mut [u8]) -> io::Result<usize> {
        std::future::pending().await
    }
}
