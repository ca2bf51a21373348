//! Peer connection manager.
//!
//! A [`PeerSession`] owns one node's identity, its live connections, the
//! reconciliation loop against the discovery directory, and the dispatch of
//! inbound frames to the two message contracts: fire-and-forget broadcast and
//! one-shot request/response.
//!
//! Inbound packets from every connection are funneled through one channel and
//! consumed by a single dispatch task, so broadcast handlers always run in
//! per-connection receive order. There is no global order across connections.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::directory::{Directory, PeerInfo};
use crate::core::error::SessionError;
use crate::core::wire::{self, Frame, Packet, RequestPayload, RrKind, RrMessage};

/// Tunables of the connection manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How often the directory is polled for joined/vanished peers.
    pub poll_interval: Duration,
    /// How long a connection attempt may take before it is abandoned.
    pub connect_timeout: Duration,
    /// How long a request waits for its response.
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

type DataHandler = Box<dyn Fn(&Packet) + Send + Sync>;
type RequestHandler = Box<dyn Fn(Value) -> Result<Value, SessionError> + Send + Sync>;
type PendingRequests = HashMap<(String, u64), oneshot::Sender<Result<Value, SessionError>>>;

/// Writer side of one open connection.
struct PeerHandle {
    outbox: mpsc::UnboundedSender<Frame>,
    next_request_id: Arc<AtomicU64>,
    /// Tells the connection task to stop. Used when the peer vanishes from
    /// the directory while the socket is still healthy.
    closer: watch::Sender<bool>,
}

pub struct PeerSession {
    peer_id: String,
    config: SessionConfig,
    directory: Arc<dyn Directory>,
    /// Self-handle for spawning owned tasks from `&self` methods.
    me: Weak<PeerSession>,
    /// Open connections, keyed by remote peer id.
    conns: Mutex<HashMap<String, PeerHandle>>,
    /// Peers with a connection open or a connect attempt in flight. Guards
    /// against duplicate simultaneous attempts to the same peer.
    handled: Mutex<HashSet<String>>,
    pending: Mutex<PendingRequests>,
    data_handlers: StdMutex<Vec<DataHandler>>,
    request_handlers: StdMutex<HashMap<String, RequestHandler>>,
    dispatch_tx: mpsc::UnboundedSender<(String, Packet)>,
    dispatch_rx: StdMutex<Option<mpsc::UnboundedReceiver<(String, Packet)>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PeerSession {
    pub fn new(
        peer_id: impl Into<String>,
        directory: Arc<dyn Directory>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let peer_id = peer_id.into();
        Arc::new_cyclic(|me| Self {
            peer_id,
            config,
            directory,
            me: me.clone(),
            conns: Mutex::new(HashMap::new()),
            handled: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            data_handlers: StdMutex::new(Vec::new()),
            request_handlers: StdMutex::new(HashMap::new()),
            dispatch_tx,
            dispatch_rx: StdMutex::new(Some(dispatch_rx)),
            shutdown_tx,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        self.conns.lock().await.keys().cloned().collect()
    }

    /// Register a broadcast handler. Every inbound packet is delivered to
    /// every handler, in registration order.
    pub fn add_data_handler(&self, handler: impl Fn(&Packet) + Send + Sync + 'static) {
        self.data_handlers
            .lock()
            .expect("data handler lock")
            .push(Box::new(handler));
    }

    /// Register the responder for one request type. Exactly one handler per
    /// type; a later registration replaces the earlier one.
    pub fn add_request_handler(
        &self,
        request_type: &str,
        handler: impl Fn(Value) -> Result<Value, SessionError> + Send + Sync + 'static,
    ) {
        self.request_handlers
            .lock()
            .expect("request handler lock")
            .insert(request_type.to_string(), Box::new(handler));
    }

    /// Bind the listener and spawn the accept, reconciliation and dispatch
    /// loops. Returns the bound address.
    pub async fn start(&self, listen: SocketAddr) -> Result<SocketAddr, SessionError> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;
        info!(peer = %self.peer_id, addr = %local, "peer session listening");

        let me = self.me.upgrade().ok_or(SessionError::Closed)?;
        let rx = self
            .dispatch_rx
            .lock()
            .expect("dispatch receiver lock")
            .take()
            .ok_or(SessionError::Closed)?;
        tokio::spawn(Arc::clone(&me).dispatch_loop(rx));
        tokio::spawn(Arc::clone(&me).accept_loop(listener));
        tokio::spawn(me.reconcile_loop());
        Ok(local)
    }

    /// Wrap `data` in a packet and send it to `recipients`, or to every open
    /// connection when `recipients` is empty. A missing or closed recipient is
    /// logged and skipped, never fatal.
    pub async fn broadcast(&self, data: Value, packet_type: &str, recipients: &[String]) {
        let conns = self.conns.lock().await;
        let receivers: Vec<String> = if recipients.is_empty() {
            conns.keys().cloned().collect()
        } else {
            recipients.to_vec()
        };
        let packet = Packet {
            sender: self.peer_id.clone(),
            receivers: receivers.clone(),
            packet_type: packet_type.to_string(),
            data,
        };
        for peer in &receivers {
            match conns.get(peer) {
                Some(handle) => {
                    if handle.outbox.send(Frame::Packet(packet.clone())).is_err() {
                        warn!(%peer, "connection writer gone, skipping recipient");
                    }
                }
                None => warn!(%peer, "no open connection, skipping recipient"),
            }
        }
    }

    /// Send a one-shot request to `peer` and await its response.
    ///
    /// Concurrent requests are multiplexed over the connection via a
    /// per-connection monotonically increasing request id. Fails with
    /// [`SessionError::NoConnection`] when no open connection to `peer`
    /// exists and with [`SessionError::RequestTimeout`] when no response
    /// arrives within the configured window.
    pub async fn request(
        &self,
        peer: &str,
        request_type: &str,
        payload: Value,
    ) -> Result<Value, SessionError> {
        if *self.shutdown_tx.borrow() {
            return Err(SessionError::Closed);
        }
        let (outbox, request_id) = {
            let conns = self.conns.lock().await;
            let handle = conns
                .get(peer)
                .ok_or_else(|| SessionError::NoConnection(peer.to_string()))?;
            (
                handle.outbox.clone(),
                handle.next_request_id.fetch_add(1, Ordering::Relaxed),
            )
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert((peer.to_string(), request_id), tx);

        let msg = RrMessage {
            kind: RrKind::Request,
            request_id,
            payload_type: Some(request_type.to_string()),
            payload: serde_json::to_value(RequestPayload {
                request_type: request_type.to_string(),
                payload,
            })?,
            error: None,
        };
        if outbox.send(Frame::Rr(msg)).is_err() {
            self.pending
                .lock()
                .await
                .remove(&(peer.to_string(), request_id));
            return Err(SessionError::NoConnection(peer.to_string()));
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // completion sender dropped without a verdict: session torn down
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .await
                    .remove(&(peer.to_string(), request_id));
                Err(SessionError::RequestTimeout(peer.to_string()))
            }
        }
    }

    /// Close every connection, stop the loops, reject all pending requests
    /// and drop all registered handlers.
    pub async fn shutdown(&self) {
        info!(peer = %self.peer_id, "shutting down peer session");
        let _ = self.shutdown_tx.send(true);
        self.conns.lock().await.clear();
        self.handled.lock().await.clear();
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(SessionError::Closed));
        }
        self.data_handlers.lock().expect("data handler lock").clear();
        self.request_handlers
            .lock()
            .expect("request handler lock")
            .clear();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        let session = Arc::clone(&self);
                        tokio::spawn(async move { session.handle_inbound(stream).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// The dialing side identifies itself first; until it does, the
    /// connection has no peer id and cannot be tracked.
    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) {
        let hello =
            tokio::time::timeout(self.config.connect_timeout, wire::read_frame(&mut stream)).await;
        match hello {
            Ok(Ok(Frame::Hello { hello_from })) => {
                self.run_connection(hello_from, stream, false).await;
            }
            Ok(Ok(_)) => warn!("peer sent data before identifying itself, dropping"),
            Ok(Err(e)) => warn!(error = %e, "inbound handshake failed"),
            Err(_) => warn!("peer did not identify itself in time, dropping"),
        }
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.reconcile_once().await,
            }
        }
    }

    /// One pass against the discovery directory: forget connections to peers
    /// no longer listed, dial listed peers not yet connected.
    async fn reconcile_once(&self) {
        let listed = self.directory.list_active_peers(&self.peer_id);
        let listed_ids: HashSet<&str> = listed.iter().map(|p| p.id.as_str()).collect();

        let stale: Vec<String> = {
            let conns = self.conns.lock().await;
            conns
                .keys()
                .filter(|id| !listed_ids.contains(id.as_str()))
                .cloned()
                .collect()
        };
        for peer in stale {
            info!(%peer, "peer no longer listed, closing connection");
            if let Some(handle) = self.conns.lock().await.remove(&peer) {
                let _ = handle.closer.send(true);
            }
        }

        for info in listed {
            {
                let conns = self.conns.lock().await;
                let mut handled = self.handled.lock().await;
                if conns.contains_key(&info.id) || handled.contains(&info.id) {
                    continue;
                }
                handled.insert(info.id.clone());
            }
            let Some(session) = self.me.upgrade() else { return };
            tokio::spawn(async move { session.dial(info).await });
        }
    }

    async fn dial(self: Arc<Self>, info: PeerInfo) {
        debug!(peer = %info.id, addr = %info.addr, "connecting");
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(info.addr)).await
        {
            Ok(Ok(stream)) => Arc::clone(&self).run_connection(info.id, stream, true).await,
            Ok(Err(e)) => {
                warn!(peer = %info.id, error = %e, "connect failed");
                self.handled.lock().await.remove(&info.id);
            }
            Err(_) => {
                warn!(peer = %info.id, "connect attempt timed out");
                self.handled.lock().await.remove(&info.id);
            }
        }
    }

    /// Drive one open connection until it closes: reads frames into the
    /// dispatch channel or the request machinery, writes queued frames out.
    ///
    /// When both sides dial each other at once, each node ends up with two
    /// sockets for the same peer. The tie-break is deterministic on both ends:
    /// the connection dialed by the lexicographically smaller peer id wins,
    /// the other is closed.
    async fn run_connection(self: Arc<Self>, peer: String, stream: TcpStream, outbound: bool) {
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Frame>();
        let (closer_tx, mut closer_rx) = watch::channel(false);
        let wins_tie = if outbound {
            self.peer_id < peer
        } else {
            peer < self.peer_id
        };
        {
            let mut conns = self.conns.lock().await;
            if conns.contains_key(&peer) {
                if !wins_tie {
                    debug!(%peer, "already connected, dropping duplicate");
                    return;
                }
                debug!(%peer, "replacing duplicate connection");
                if let Some(old) = conns.remove(&peer) {
                    let _ = old.closer.send(true);
                }
            }
            conns.insert(
                peer.clone(),
                PeerHandle {
                    outbox: outbox_tx.clone(),
                    next_request_id: Arc::new(AtomicU64::new(0)),
                    closer: closer_tx,
                },
            );
            self.handled.lock().await.insert(peer.clone());
        }
        info!(%peer, "connection open");

        // identify ourselves before anything else crosses the wire
        let _ = outbox_tx.send(Frame::Hello {
            hello_from: self.peer_id.clone(),
        });

        let (mut reader, mut writer) = stream.into_split();
        let mut shutdown = self.shutdown_tx.subscribe();

        let read_loop = async {
            loop {
                let frame = wire::read_frame(&mut reader).await?;
                match frame {
                    Frame::Hello { hello_from } => debug!(%hello_from, "peer identified"),
                    Frame::Packet(packet) => {
                        if self.dispatch_tx.send((peer.clone(), packet)).is_err() {
                            break;
                        }
                    }
                    Frame::Rr(msg) => match msg.kind {
                        RrKind::Request => {
                            let response = self.handle_request(msg);
                            if outbox_tx.send(Frame::Rr(response)).is_err() {
                                break;
                            }
                        }
                        RrKind::Response => self.complete_request(&peer, msg).await,
                    },
                }
            }
            Ok::<(), SessionError>(())
        };

        let write_loop = async {
            while let Some(frame) = outbox_rx.recv().await {
                wire::write_frame(&mut writer, &frame).await?;
            }
            Ok::<(), SessionError>(())
        };

        let result = tokio::select! {
            r = read_loop => r,
            w = write_loop => w,
            _ = shutdown.changed() => Ok(()),
            // fires on an explicit close or when the handle is dropped
            _ = closer_rx.changed() => Ok(()),
        };
        match result {
            Ok(()) => info!(%peer, "connection closed"),
            Err(e) => warn!(%peer, error = %e, "connection closed with error"),
        }

        // tear down only if the table still holds this connection; a replaced
        // duplicate must not take the winner's state with it
        let was_active = {
            let mut conns = self.conns.lock().await;
            match conns.get(&peer) {
                Some(h) if h.outbox.same_channel(&outbox_tx) => {
                    conns.remove(&peer);
                    true
                }
                _ => false,
            }
        };
        if was_active {
            self.handled.lock().await.remove(&peer);
            self.reject_pending_for(&peer).await;
        }
    }

    /// Route an inbound request to its registered handler and build the
    /// response envelope. An unregistered type answers with an error, it
    /// never fails locally.
    fn handle_request(&self, msg: RrMessage) -> RrMessage {
        let request_id = msg.request_id;
        let respond = |payload_type: Option<String>, payload: Value, error: Option<String>| {
            RrMessage {
                kind: RrKind::Response,
                request_id,
                payload_type,
                payload,
                error,
            }
        };

        let req: RequestPayload = match serde_json::from_value(msg.payload) {
            Ok(req) => req,
            Err(e) => return respond(None, Value::Null, Some(format!("malformed request: {e}"))),
        };
        debug!(request_type = %req.request_type, request_id, "handling request");

        let handlers = self.request_handlers.lock().expect("request handler lock");
        match handlers.get(&req.request_type) {
            Some(handler) => match handler(req.payload) {
                Ok(payload) => respond(Some(req.request_type.clone()), payload, None),
                Err(e) => respond(Some(req.request_type.clone()), Value::Null, Some(e.to_string())),
            },
            None => respond(
                Some(req.request_type.clone()),
                Value::Null,
                Some(SessionError::NoHandler(req.request_type.clone()).to_string()),
            ),
        }
    }

    /// Resolve the pending request matching an inbound response.
    async fn complete_request(&self, peer: &str, msg: RrMessage) {
        let key = (peer.to_string(), msg.request_id);
        let Some(tx) = self.pending.lock().await.remove(&key) else {
            debug!(%peer, request_id = msg.request_id, "response for unknown request");
            return;
        };
        let result = match msg.error {
            Some(message) => Err(SessionError::Remote {
                peer: peer.to_string(),
                message,
            }),
            None => Ok(msg.payload),
        };
        let _ = tx.send(result);
    }

    async fn reject_pending_for(&self, peer: &str) {
        let mut pending = self.pending.lock().await;
        let keys: Vec<_> = pending
            .keys()
            .filter(|(p, _)| p == peer)
            .cloned()
            .collect();
        for key in keys {
            if let Some(tx) = pending.remove(&key) {
                let _ = tx.send(Err(SessionError::NoConnection(peer.to_string())));
            }
        }
    }

    /// Single consumer of all inbound packets. Handlers run here, in order;
    /// a panicking handler is contained and logged, never propagated.
    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(String, Packet)>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = rx.recv() => {
                    let Some((from, packet)) = received else { break };
                    debug!(%from, packet_type = %packet.packet_type, "dispatching packet");
                    let handlers = self.data_handlers.lock().expect("data handler lock");
                    for handler in handlers.iter() {
                        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            handler(&packet)
                        }));
                        if outcome.is_err() {
                            error!(packet_type = %packet.packet_type, "data handler panicked");
                        }
                    }
                }
            }
        }
    }
}
