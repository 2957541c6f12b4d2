//! Named channels multiplexed over one physical connection
//!
//! The [`Multiplexer`] owns the routing table (`channel name -> route`) and
//! the single write queue of the current physical link. A [`Channel`] writes
//! whole frames into that queue and receives the frames tagged with its name.
//!
//! ## Lifecycle
//!
//! - Routes exist only while a channel is open; closing a channel removes its
//!   route. Nothing is collected on a timer.
//! - When the physical link drops, every open channel receives
//!   [`ChannelEvent::Close`] and its route is removed.
//! - Attaching a new link does not reopen channels; owners call
//!   [`Channel::connect`] themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Frame, Payload};
use crate::transport::Transport;

/// Connectivity of the physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// No link attached
    Offline,
    /// A link is attached and reading
    Online,
    /// The multiplexer was shut down for good
    Destroyed,
}

/// Whether a channel currently has a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closed,
}

/// Something that happened on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A payload addressed to this channel
    Data(Payload),
    /// The channel is closed; no more events follow until `connect`
    Close,
}

struct Route {
    id: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

struct MuxInner {
    routes: Mutex<HashMap<String, Route>>,
    link: Mutex<Option<Link>>,
    connectivity: watch::Sender<Connectivity>,
    next_route: AtomicU64,
    next_generation: AtomicU64,
}

/// Demultiplexer for one physical connection
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        let (connectivity, _) = watch::channel(Connectivity::Offline);
        Self {
            inner: Arc::new(MuxInner {
                routes: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                connectivity,
                next_route: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Open a channel, routing frames tagged `name` to it
    pub fn channel(&self, name: &str) -> SyncResult<Channel> {
        let (route_id, events) = self.inner.register(name)?;
        debug!("Opened channel {}", name);
        Ok(Channel {
            name: name.to_string(),
            mux: Arc::downgrade(&self.inner),
            route_id,
            events,
        })
    }

    /// Use `transport` as the physical link, replacing any current one
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, transport: Transport) {
        self.detach();

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let Transport {
            outbound,
            mut inbound,
        } = transport;

        let weak = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            while let Some(bytes) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.route(&bytes);
            }
            if let Some(inner) = weak.upgrade() {
                debug!("Physical link {} ended", generation);
                inner.drop_link(Some(generation));
            }
        });

        *self.inner.link.lock() = Some(Link {
            generation,
            outbound,
            reader,
        });
        self.inner.connectivity.send_replace(Connectivity::Online);
        debug!("Attached physical link {}", generation);
    }

    /// Drop the physical link; every open channel is closed
    pub fn detach(&self) {
        self.inner.drop_link(None);
    }

    /// Detach and refuse further use
    pub fn destroy(&self) {
        self.detach();
        self.inner
            .connectivity
            .send_replace(Connectivity::Destroyed);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.inner.connectivity.subscribe()
    }

    /// Number of routed channels
    pub fn open_channels(&self) -> usize {
        self.inner.routes.lock().len()
    }
}

impl MuxInner {
    fn register(&self, name: &str) -> SyncResult<(u64, mpsc::UnboundedReceiver<ChannelEvent>)> {
        if *self.connectivity.borrow() == Connectivity::Destroyed {
            return Err(SyncError::Closed);
        }
        let mut routes = self.routes.lock();
        if routes.contains_key(name) {
            return Err(SyncError::ChannelInUse(name.to_string()));
        }
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(name.to_string(), Route { id, events: tx });
        Ok((id, rx))
    }

    fn is_routed(&self, name: &str, route_id: u64) -> bool {
        self.routes
            .lock()
            .get(name)
            .is_some_and(|route| route.id == route_id)
    }

    /// Remove a route if it still belongs to `route_id`
    fn unregister(&self, name: &str, route_id: u64) -> bool {
        let mut routes = self.routes.lock();
        if routes.get(name).is_some_and(|route| route.id == route_id) {
            routes.remove(name);
            true
        } else {
            false
        }
    }

    /// The single entry point to the wire
    ///
    /// Each queue item is one whole frame, so frames from different channels
    /// never interleave.
    fn send(&self, frame: &Frame) -> bool {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping unencodable frame for {}: {}", frame.channel, e);
                return false;
            }
        };
        let link = self.link.lock();
        match link.as_ref() {
            Some(link) => link.outbound.try_send(bytes).is_ok(),
            None => false,
        }
    }

    /// Deliver one inbound frame to its channel
    fn route(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };
        trace!("Frame {} for {}", frame.payload.cmd(), frame.channel);

        let mut routes = self.routes.lock();
        let Some(route) = routes.get(&frame.channel) else {
            debug!("Dropping frame for unknown channel {}", frame.channel);
            return;
        };

        if frame.payload == Payload::Close {
            let _ = route.events.send(ChannelEvent::Close);
            routes.remove(&frame.channel);
            return;
        }

        if route.events.send(ChannelEvent::Data(frame.payload)).is_err() {
            // Receiver is gone without closing; reclaim the route
            routes.remove(&frame.channel);
        }
    }

    /// Tear down the current link (or only `generation`, if given)
    fn drop_link(&self, generation: Option<u64>) {
        let link = {
            let mut guard = self.link.lock();
            let stale = match (guard.as_ref(), generation) {
                (None, _) => true,
                (Some(current), Some(g)) => current.generation != g,
                (Some(_), None) => false,
            };
            if stale {
                return;
            }
            guard.take()
        };
        let Some(link) = link else { return };
        if generation.is_none() {
            link.reader.abort();
        }

        // Offline goes out before any Close, so a channel owner seeing Close
        // can tell the link went away
        if *self.connectivity.borrow() != Connectivity::Destroyed {
            self.connectivity.send_replace(Connectivity::Offline);
        }

        let closed: Vec<(String, Route)> = self.routes.lock().drain().collect();
        for (name, route) in closed {
            debug!("Closing channel {} (link lost)", name);
            let _ = route.events.send(ChannelEvent::Close);
        }
    }
}

/// One logical stream on a shared connection
pub struct Channel {
    name: String,
    mux: Weak<MuxInner>,
    route_id: u64,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ready_state(&self) -> ReadyState {
        match self.mux.upgrade() {
            Some(inner) if inner.is_routed(&self.name, self.route_id) => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Queue `payload` for the peer
    ///
    /// Returns false if the channel is closed, there is no physical link, or
    /// the write queue is full; callers should hold off and retry.
    pub fn write(&self, payload: Payload) -> bool {
        let Some(inner) = self.mux.upgrade() else {
            return false;
        };
        if !inner.is_routed(&self.name, self.route_id) {
            return false;
        }
        inner.send(&Frame::new(self.name.clone(), payload))
    }

    /// Next event; `None` once closed and drained
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Re-open a closed channel under the same name
    pub fn connect(&mut self) -> SyncResult<()> {
        let inner = self.mux.upgrade().ok_or(SyncError::Closed)?;
        if inner.is_routed(&self.name, self.route_id) {
            return Ok(());
        }
        let (route_id, events) = inner.register(&self.name)?;
        self.route_id = route_id;
        self.events = events;
        debug!("Reconnected channel {}", self.name);
        Ok(())
    }

    /// Tell the peer we are done and release the route; idempotent
    pub fn close(&mut self) {
        let Some(inner) = self.mux.upgrade() else {
            return;
        };
        if inner.is_routed(&self.name, self.route_id) {
            inner.send(&Frame::new(self.name.clone(), Payload::Close));
            inner.unregister(&self.name, self.route_id);
            debug!("Closed channel {}", self.name);
        }
        self.events.close();
    }

    /// Same as [`Channel::close`]
    pub fn end(&mut self) {
        self.close();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, VersionedChange};
    use std::time::Duration;

    fn update(n: u64) -> Payload {
        let mut record = Record::new();
        record.insert("id".into(), n.into());
        Payload::Update {
            changes: vec![VersionedChange::new(record, n)],
        }
    }

    async fn next(channel: &mut Channel) -> Option<ChannelEvent> {
        tokio::time::timeout(Duration::from_secs(2), channel.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_channel_name_is_exclusive() {
        let mux = Multiplexer::new();
        let _a = mux.channel("a").unwrap();
        assert!(matches!(mux.channel("a"), Err(SyncError::ChannelInUse(_))));
    }

    #[tokio::test]
    async fn test_write_without_link_is_refused() {
        let mux = Multiplexer::new();
        let a = mux.channel("a").unwrap();
        assert!(a.is_open());
        assert!(!a.write(Payload::Close));
    }

    #[tokio::test]
    async fn test_frames_are_routed_by_name() {
        let mux = Multiplexer::new();
        let (ours, mut peer) = Transport::pair(8);
        mux.attach(ours);

        let mut a = mux.channel("a").unwrap();
        let mut b = mux.channel("b").unwrap();

        assert!(a.write(update(1)));
        let frame = Frame::decode(&peer.inbound.recv().await.unwrap()).unwrap();
        assert_eq!(frame.channel, "a");

        peer.outbound
            .send(Frame::new("b", update(2)).encode().unwrap())
            .await
            .unwrap();
        peer.outbound
            .send(Frame::new("a", update(3)).encode().unwrap())
            .await
            .unwrap();

        assert_eq!(next(&mut b).await, Some(ChannelEvent::Data(update(2))));
        assert_eq!(next(&mut a).await, Some(ChannelEvent::Data(update(3))));
    }

    #[tokio::test]
    async fn test_closing_one_channel_leaves_others() {
        let mux = Multiplexer::new();
        let (ours, mut peer) = Transport::pair(8);
        mux.attach(ours);

        let mut a = mux.channel("a").unwrap();
        let mut b = mux.channel("b").unwrap();
        a.close();
        a.close();

        assert_eq!(a.ready_state(), ReadyState::Closed);
        assert_eq!(b.ready_state(), ReadyState::Open);
        assert_eq!(mux.open_channels(), 1);

        // The peer is told about the close
        let frame = Frame::decode(&peer.inbound.recv().await.unwrap()).unwrap();
        assert_eq!(frame, Frame::new("a", Payload::Close));

        peer.outbound
            .send(Frame::new("b", update(4)).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(next(&mut b).await, Some(ChannelEvent::Data(update(4))));
    }

    #[tokio::test]
    async fn test_link_loss_closes_every_channel() {
        let mux = Multiplexer::new();
        let (ours, _peer) = Transport::pair(8);
        mux.attach(ours);
        let mut status = mux.connectivity();
        assert_eq!(*status.borrow_and_update(), Connectivity::Online);

        let mut a = mux.channel("a").unwrap();
        let mut b = mux.channel("b").unwrap();
        mux.detach();

        assert_eq!(next(&mut a).await, Some(ChannelEvent::Close));
        assert_eq!(next(&mut b).await, Some(ChannelEvent::Close));
        assert_eq!(mux.open_channels(), 0);
        assert_eq!(*status.borrow(), Connectivity::Offline);

        // A new link does not reopen anything
        let (ours, _peer) = Transport::pair(8);
        mux.attach(ours);
        assert!(!a.is_open());

        a.connect().unwrap();
        assert!(a.is_open());
        assert!(!b.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_link_loss_is_visible_before_close() {
        let mux = Multiplexer::new();
        for _ in 0..50 {
            let (ours, _peer) = Transport::pair(8);
            mux.attach(ours);
            let mut a = mux.channel("a").unwrap();
            let status = mux.connectivity();

            let watcher = tokio::spawn(async move {
                assert_eq!(next(&mut a).await, Some(ChannelEvent::Close));
                *status.borrow()
            });
            tokio::task::yield_now().await;
            mux.detach();
            assert_eq!(watcher.await.unwrap(), Connectivity::Offline);
        }
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_channels() {
        let mux = Multiplexer::new();
        let (ours, peer) = Transport::pair(8);
        mux.attach(ours);
        let mut a = mux.channel("a").unwrap();

        drop(peer);
        assert_eq!(next(&mut a).await, Some(ChannelEvent::Close));
        assert!(!mux.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let mux = Multiplexer::new();
        let (ours, peer) = Transport::pair(8);
        mux.attach(ours);
        let mut a = mux.channel("a").unwrap();

        peer.outbound.send(vec![0xff, 0xfe]).await.unwrap();
        peer.outbound
            .send(Frame::new("a", update(5)).encode().unwrap())
            .await
            .unwrap();

        assert_eq!(next(&mut a).await, Some(ChannelEvent::Data(update(5))));
        assert!(a.is_open());
    }

    #[tokio::test]
    async fn test_full_queue_signals_backpressure() {
        let mux = Multiplexer::new();
        let (ours, _peer) = Transport::pair(1);
        mux.attach(ours);
        let a = mux.channel("a").unwrap();

        assert!(a.write(update(1)));
        assert!(!a.write(update(2)));
    }
}
