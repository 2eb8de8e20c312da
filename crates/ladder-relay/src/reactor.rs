//! Tokio transport for a [`Node`].
//!
//! One actor task owns the node and is the only place it is touched.
//! Every connection gets a reader task that feeds the actor and a writer
//! task that drains an ordered queue of outgoing buffers, so the node sees
//! a single serialized stream of events and never blocks on a socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::{Expired, Key};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::error::RelayError;
use crate::session::{Action, Event, LinkId, ListenerKind, Node, TimerKind};

const TIMER_KINDS: [TimerKind; 3] = [
    TimerKind::KeepaliveIdle,
    TimerKind::PongWait,
    TimerKind::DeferredFlush,
];

/// Messages from I/O tasks to the actor.
enum Inbound {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
        listener: ListenerKind,
    },
    Connected {
        link: LinkId,
        stream: TcpStream,
        peer: SocketAddr,
    },
    ConnectFailed {
        link: LinkId,
        error: RelayError,
    },
    Received {
        link: LinkId,
        data: Bytes,
    },
    Closed {
        link: LinkId,
    },
}

enum WriterCommand {
    Data(Bytes),
    Close,
}

enum Wake {
    Shutdown,
    Inbound(Option<Inbound>),
    Timer(Option<Expired<(LinkId, TimerKind)>>),
}

/// Runs `node` until shutdown is requested or the node stops on a fatal
/// error.
pub async fn run(node: Node, shutdown: CancellationToken) -> Result<(), RelayError> {
    let mut reactor = Reactor::new(node);
    let result = reactor.run(shutdown).await;
    reactor.teardown();
    result
}

struct Reactor {
    node: Node,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    writers: HashMap<LinkId, mpsc::UnboundedSender<WriterCommand>>,
    readers: HashMap<LinkId, AbortHandle>,
    connects: HashMap<LinkId, JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
    timers: DelayQueue<(LinkId, TimerKind)>,
    timer_keys: HashMap<(LinkId, TimerKind), Key>,
    buffer_size: usize,
    connect_timeout: Duration,
    tcp_no_delay: bool,
}

impl Reactor {
    fn new(node: Node) -> Self {
        let timeouts = node.core().timeouts();
        let buffer_size = timeouts.relay_buffer_size;
        let connect_timeout = timeouts.connect_timeout();
        let tcp_no_delay = timeouts.tcp_no_delay;
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            node,
            tx,
            rx,
            writers: HashMap::new(),
            readers: HashMap::new(),
            connects: HashMap::new(),
            listeners: Vec::new(),
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            buffer_size,
            connect_timeout,
            tcp_no_delay,
        }
    }

    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), RelayError> {
        self.dispatch(Event::Started).await?;
        loop {
            let timers = &mut self.timers;
            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Wake::Shutdown,
                msg = self.rx.recv() => Wake::Inbound(msg),
                expired = std::future::poll_fn(|cx| timers.poll_expired(cx)), if !timers.is_empty() => {
                    Wake::Timer(expired)
                }
            };
            match wake {
                Wake::Shutdown => {
                    info!(role = %self.node.role(), "shutting down");
                    self.node.shutdown();
                    let actions = self.node.take_actions();
                    return self.apply(actions).await;
                }
                Wake::Inbound(Some(msg)) => self.on_inbound(msg).await?,
                Wake::Inbound(None) => return Ok(()),
                Wake::Timer(Some(expired)) => {
                    let (link, timer) = expired.into_inner();
                    self.timer_keys.remove(&(link, timer));
                    self.dispatch(Event::TimerFired { link, timer }).await?;
                }
                Wake::Timer(None) => {}
            }
        }
    }

    /// Feeds one event to the node and carries out what it asked for,
    /// including the quiet closes it queues when it stops on an error.
    async fn dispatch(&mut self, event: Event) -> Result<(), RelayError> {
        let result = self.node.handle(event);
        let actions = self.node.take_actions();
        self.apply(actions).await?;
        result
    }

    async fn on_inbound(&mut self, msg: Inbound) -> Result<(), RelayError> {
        match msg {
            Inbound::Accepted {
                stream,
                peer,
                listener,
            } => {
                let link = self.node.new_link_id();
                self.attach(link, stream, peer);
                self.dispatch(Event::Accepted {
                    link,
                    peer,
                    listener,
                })
                .await
            }
            Inbound::Connected { link, stream, peer } => {
                self.connects.remove(&link);
                self.attach(link, stream, peer);
                self.dispatch(Event::Connected { link, peer }).await
            }
            Inbound::ConnectFailed { link, error } => {
                self.connects.remove(&link);
                self.dispatch(Event::ConnectFailed { link, error }).await
            }
            Inbound::Received { link, data } => {
                self.dispatch(Event::Received { link, data }).await
            }
            Inbound::Closed { link } => self.dispatch(Event::Disconnected { link }).await,
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) -> Result<(), RelayError> {
        for action in actions {
            match action {
                Action::Listen { addr, listener } => self.listen(&addr, listener).await?,
                Action::Connect { link, addr } => self.connect(link, addr),
                Action::Send { link, data } => match self.writers.get(&link) {
                    Some(writer) => {
                        if writer.send(WriterCommand::Data(data)).is_err() {
                            trace!(link = %link, "writer already gone, close is pending");
                        }
                    }
                    None => trace!(link = %link, bytes = data.len(), "send to detached link dropped"),
                },
                Action::Close { link, reason } => {
                    trace!(link = %link, reason = %reason, "closing connection");
                    self.detach(link);
                }
                Action::Schedule { link, timer, delay } => {
                    match self.timer_keys.get(&(link, timer)) {
                        Some(key) => self.timers.reset(key, delay),
                        None => {
                            let key = self.timers.insert((link, timer), delay);
                            self.timer_keys.insert((link, timer), key);
                        }
                    }
                }
                Action::Cancel { link, timer } => self.cancel_timer(link, timer),
            }
        }
        Ok(())
    }

    async fn listen(&mut self, addr: &str, kind: ListenerKind) -> Result<(), RelayError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(listen = %local, kind = ?kind, "listening");
        let tx = self.tx.clone();
        self.listeners.push(tokio::spawn(accept_loop(listener, kind, tx)));
        Ok(())
    }

    fn connect(&mut self, link: LinkId, addr: String) {
        let tx = self.tx.clone();
        let timeout = self.connect_timeout;
        let handle = tokio::spawn(
            async move {
                let outcome = tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await;
                let msg = match outcome {
                    Ok(Ok(stream)) => match stream.peer_addr() {
                        Ok(peer) => Inbound::Connected { link, stream, peer },
                        Err(e) => Inbound::ConnectFailed {
                            link,
                            error: e.into(),
                        },
                    },
                    Ok(Err(e)) => Inbound::ConnectFailed {
                        link,
                        error: e.into(),
                    },
                    Err(_) => Inbound::ConnectFailed {
                        link,
                        error: RelayError::ConnectTimeout(addr),
                    },
                };
                let _ = tx.send(msg);
            }
            .instrument(info_span!("connect", link = %link)),
        );
        self.connects.insert(link, handle);
    }

    /// Starts the reader and writer tasks of a connected socket.
    fn attach(&mut self, link: LinkId, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.tcp_no_delay) {
            debug!(link = %link, error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let span = info_span!("link", id = %link, peer = %peer);

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            write_loop(write_half, link, writer_rx, self.tx.clone()).instrument(span.clone()),
        );
        self.writers.insert(link, writer_tx);

        let reader = tokio::spawn(
            read_loop(read_half, link, self.tx.clone(), self.buffer_size).instrument(span),
        );
        self.readers.insert(link, reader.abort_handle());
    }

    /// Stops reading, lets queued writes drain, then shuts the socket.
    fn detach(&mut self, link: LinkId) {
        if let Some(writer) = self.writers.remove(&link) {
            let _ = writer.send(WriterCommand::Close);
        }
        if let Some(reader) = self.readers.remove(&link) {
            reader.abort();
        }
        if let Some(connect) = self.connects.remove(&link) {
            connect.abort();
        }
        for timer in TIMER_KINDS {
            self.cancel_timer(link, timer);
        }
    }

    fn cancel_timer(&mut self, link: LinkId, timer: TimerKind) {
        if let Some(key) = self.timer_keys.remove(&(link, timer)) {
            self.timers.remove(&key);
        }
    }

    fn teardown(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        for (_, connect) in self.connects.drain() {
            connect.abort();
        }
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
        for (_, writer) in self.writers.drain() {
            let _ = writer.send(WriterCommand::Close);
        }
        self.timers.clear();
        self.timer_keys.clear();
    }
}

async fn accept_loop(listener: TcpListener, kind: ListenerKind, tx: mpsc::UnboundedSender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let msg = Inbound::Accepted {
                    stream,
                    peer,
                    listener: kind,
                };
                if tx.send(msg).is_err() {
                    return;
                }
            }
            Err(e) => warn!(kind = ?kind, error = %e, "accept failed"),
        }
    }
}

async fn read_loop(
    mut half: OwnedReadHalf,
    link: LinkId,
    tx: mpsc::UnboundedSender<Inbound>,
    buffer_size: usize,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.reserve(buffer_size);
        match half.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "read");
                let data = buf.split().freeze();
                if tx.send(Inbound::Received { link, data }).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "read failed");
                break;
            }
        }
    }
    let _ = tx.send(Inbound::Closed { link });
}

/// Drains queued writes. A failed write reports the link closed so the node
/// tears it down without waiting for the read half.
async fn write_loop(
    mut half: OwnedWriteHalf,
    link: LinkId,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Data(data) => {
                if let Err(e) = half.write_all(&data).await {
                    debug!(error = %e, "write failed");
                    let _ = tx.send(Inbound::Closed { link });
                    break;
                }
            }
            WriterCommand::Close => break,
        }
    }
    let _ = half.shutdown().await;
}
