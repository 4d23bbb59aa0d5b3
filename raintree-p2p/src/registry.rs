//! Connection registry.
//!
//! Two independent address-keyed pools: sockets we dialed and sockets the
//! listener accepted. Get-or-create runs under a single lock so two callers
//! racing for the same address end up with the same socket.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{P2pError, P2pResult};
use crate::peer::ConnectionDirection;
use crate::socket::{Runner, Socket, SocketOptions};

/// Lazily-populated pool of sockets for one direction.
#[derive(Debug)]
pub struct SocketPool {
    direction: ConnectionDirection,
    capacity: usize,
    options: SocketOptions,
    runner: Runner,
    sockets: Mutex<HashMap<String, Socket>>,
}

impl SocketPool {
    /// Create an empty pool holding at most `capacity` sockets.
    pub fn new(
        direction: ConnectionDirection,
        capacity: usize,
        options: SocketOptions,
        runner: Runner,
    ) -> Self {
        Self {
            direction,
            capacity,
            options,
            runner,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    /// Direction of every socket in this pool.
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Maximum number of sockets.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the socket for `addr`, creating an unopened one on a miss.
    ///
    /// The flag is `true` when the socket already existed. A socket that
    /// has reached its terminal state counts as a miss and is replaced.
    /// When the pool is full, closed sockets are pruned first; if it is
    /// still full the call fails instead of evicting a live connection.
    pub fn get(&self, addr: &str) -> P2pResult<(Socket, bool)> {
        let mut sockets = self.sockets.lock();

        if let Some(socket) = sockets.get(addr) {
            if !socket.is_terminated() {
                return Ok((socket.clone(), true));
            }
            sockets.remove(addr);
        }

        if sockets.len() >= self.capacity {
            sockets.retain(|_, s| !s.is_terminated());
            if sockets.len() >= self.capacity {
                return Err(P2pError::MaxConnectionsReached {
                    direction: self.direction,
                    max: self.capacity,
                });
            }
        }

        let socket = Socket::new(addr, self.direction, self.options, self.runner.clone());
        sockets.insert(addr.to_string(), socket.clone());
        tracing::trace!(addr, direction = %self.direction, "Socket registered");
        Ok((socket, false))
    }

    /// Look up a socket without creating one.
    pub fn find(&self, addr: &str) -> Option<Socket> {
        self.sockets.lock().get(addr).cloned()
    }

    /// Whether a socket is registered for `addr`.
    pub fn peak(&self, addr: &str) -> bool {
        self.sockets.lock().contains_key(addr)
    }

    /// Unregister the socket for `addr`.
    pub fn remove(&self, addr: &str) -> Option<Socket> {
        self.sockets.lock().remove(addr)
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered socket.
    pub fn sockets(&self) -> Vec<Socket> {
        self.sockets.lock().values().cloned().collect()
    }

    /// Close and unregister every socket.
    pub fn close_all(&self) -> Vec<Socket> {
        let drained: Vec<Socket> = self.sockets.lock().drain().map(|(_, s)| s).collect();
        for socket in &drained {
            socket.close();
        }
        drained
    }
}

/// Inbound and outbound pools.
#[derive(Debug)]
pub struct ConnectionRegistry {
    /// Sockets accepted by the listener, keyed by remote address.
    pub inbound: SocketPool,
    /// Sockets we dialed, keyed by service URL.
    pub outbound: SocketPool,
}

impl ConnectionRegistry {
    /// Create both pools.
    pub fn new(
        max_inbound: usize,
        max_outbound: usize,
        options: SocketOptions,
        runner: Runner,
    ) -> Self {
        Self {
            inbound: SocketPool::new(
                ConnectionDirection::Inbound,
                max_inbound,
                options,
                runner.clone(),
            ),
            outbound: SocketPool::new(ConnectionDirection::Outbound, max_outbound, options, runner),
        }
    }

    /// Pool for `direction`.
    pub fn pool(&self, direction: ConnectionDirection) -> &SocketPool {
        match direction {
            ConnectionDirection::Inbound => &self.inbound,
            ConnectionDirection::Outbound => &self.outbound,
        }
    }

    /// Close every socket in both pools.
    pub fn close_all(&self) -> Vec<Socket> {
        let mut closed = self.inbound.close_all();
        closed.extend(self.outbound.close_all());
        closed
    }

    /// Total number of registered sockets.
    pub fn len(&self) -> usize {
        self.inbound.len() + self.outbound.len()
    }

    /// Whether both pools are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
