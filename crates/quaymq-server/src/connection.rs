//! Connection handler.
//!
//! Every accepted socket is served by one `Connection` on its own thread with
//! a private mio `Poll`. The poll wakes for socket readiness, for the
//! session's mailbox (via a `Waker`) and for the nearest deadline: connect
//! timeout, keep-alive expiry or a QoS retransmission.
//!
//! A connection ends with exactly one [`Exit`]; teardown then decides whether
//! the will is published and hands the session back to the registry.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use crossbeam_channel::Receiver;
use log::{debug, info, trace, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use quaymq_core::{
    decode_packet, validate_topic, Connack, ConnackCode, Connect, Packet, ProtocolError, Publish,
    QoS, Suback, Subscribe, Unsubscribe, SUBACK_FAILURE,
};

use crate::config::Config;
use crate::qos::{QosEngine, QosError};
use crate::router::TopicRouter;
use crate::session::{CloseReason, Outbound, SessionHandle, Teardown};
use crate::subscription::{is_valid_filter, is_valid_topic_name};
use crate::util::{earliest, ThrottledCounter};
use crate::will::PendingWill;
use crate::write_buffer::WriteBuffer;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

const READ_CHUNK: usize = 4096;

/// How long a closing connection may spend flushing its last packets.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Interval between repeated "dropped QoS 0" warnings.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(10);

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const FORCED: u8 = 2;

/// State shared by every connection of one broker.
pub struct BrokerContext {
    pub config: Arc<Config>,
    pub router: Arc<TopicRouter>,
}

/// Broker-side handle used to stop one connection from another thread.
#[derive(Debug)]
pub struct ConnectionControl {
    waker: Arc<Waker>,
    state: AtomicU8,
}

impl ConnectionControl {
    /// Ask the connection to flush pending output and close without
    /// publishing its will.
    pub fn drain(&self) {
        self.raise(DRAINING);
    }

    /// Close immediately.
    pub fn force(&self) {
        self.raise(FORCED);
    }

    fn raise(&self, level: u8) {
        if self.state.fetch_max(level, Ordering::AcqRel) < level {
            if let Err(e) = self.waker.wake() {
                warn!("Failed to wake connection: {}", e);
            }
        }
    }

    fn level(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// How a connection ended.
#[derive(Debug)]
pub enum Exit {
    /// The client sent DISCONNECT.
    Disconnect,
    /// The peer closed the socket without DISCONNECT.
    PeerClosed,
    /// CONNECT was answered with a refusal code.
    Refused(ConnackCode),
    /// Closed by the broker: takeover or shutdown.
    Closed(CloseReason),
    /// Shutdown grace period ran out.
    Forced,
    Timeout(&'static str),
    Protocol(ProtocolError),
    Delivery(QosError),
    Io(io::Error),
}

impl Exit {
    /// Whether the will must be published for this kind of close.
    pub fn publishes_will(&self) -> bool {
        !matches!(
            self,
            Exit::Disconnect
                | Exit::Refused(_)
                | Exit::Closed(CloseReason::Shutdown)
                | Exit::Forced
        )
    }
}

impl From<quaymq_core::Error> for Exit {
    fn from(e: quaymq_core::Error) -> Self {
        match e {
            quaymq_core::Error::Io(e) => Exit::Io(e),
            quaymq_core::Error::Protocol(e) => Exit::Protocol(e),
        }
    }
}

impl From<QosError> for Exit {
    fn from(e: QosError) -> Self {
        Exit::Delivery(e)
    }
}

impl From<io::Error> for Exit {
    fn from(e: io::Error) -> Self {
        Exit::Io(e)
    }
}

fn violation(msg: impl Into<String>) -> Exit {
    Exit::Protocol(ProtocolError::Violation(msg.into()))
}

/// A session bound to this connection after a successful CONNECT.
struct Active {
    handle: Arc<SessionHandle>,
    mailbox: Receiver<Outbound>,
    engine: QosEngine,
    will: PendingWill,
    /// Inbound silence allowed before the client is considered gone.
    idle_timeout: Option<Duration>,
}

struct Closing {
    exit: Exit,
    deadline: Instant,
}

pub struct Connection {
    poll: Poll,
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<BrokerContext>,
    control: Arc<ConnectionControl>,
    read_buf: BytesMut,
    write_buf: WriteBuffer,
    /// WRITABLE interest is registered only while output is pending.
    want_write: bool,
    session: Option<Active>,
    connect_deadline: Option<Instant>,
    last_inbound: Instant,
    closing: Option<Closing>,
    dropped: ThrottledCounter,
}

impl Connection {
    pub fn new(
        mut stream: TcpStream,
        peer: SocketAddr,
        context: Arc<BrokerContext>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, SOCKET, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }

        let now = Instant::now();
        let write_limit = context.config.limits.client_write_buffer_size;
        let connect_deadline = context.config.connect_timeout().map(|t| now + t);

        Ok(Self {
            poll,
            stream,
            peer,
            control: Arc::new(ConnectionControl {
                waker,
                state: AtomicU8::new(RUNNING),
            }),
            context,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: WriteBuffer::new(write_limit),
            want_write: false,
            session: None,
            connect_deadline,
            last_inbound: now,
            closing: None,
            dropped: ThrottledCounter::new(DROP_LOG_INTERVAL),
        })
    }

    pub fn control(&self) -> Arc<ConnectionControl> {
        self.control.clone()
    }

    /// Serve the connection until it ends, then tear it down.
    pub fn run(mut self) -> Exit {
        let exit = self.serve();
        self.teardown(&exit);
        exit
    }

    fn serve(&mut self) -> Exit {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(exit) = self.step(&mut events) {
                return exit;
            }
        }
    }

    fn step(&mut self, events: &mut Events) -> Result<(), Exit> {
        let now = Instant::now();
        self.check_control()?;
        self.check_timers(now)?;
        self.pump_engine()?;
        self.flush()?;

        if let Some(closing) = self.closing.take() {
            if self.write_buf.is_empty() || now >= closing.deadline {
                return Err(closing.exit);
            }
            self.closing = Some(closing);
        }

        let timeout = self
            .next_deadline()
            .map(|d| d.saturating_duration_since(now));
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Exit::Io(e)),
        }

        for event in events.iter() {
            if event.token() != SOCKET {
                continue;
            }
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                self.read_socket()?;
            }
            if event.is_writable() {
                self.flush()?;
            }
        }

        self.check_mailbox()
    }

    fn next_deadline(&self) -> Option<Instant> {
        if let Some(closing) = &self.closing {
            return Some(closing.deadline);
        }
        match &self.session {
            None => self.connect_deadline,
            Some(active) => earliest(
                active.idle_timeout.map(|t| self.last_inbound + t),
                active.engine.next_deadline(),
            ),
        }
    }

    fn check_control(&mut self) -> Result<(), Exit> {
        match self.control.level() {
            FORCED => Err(Exit::Forced),
            DRAINING if self.session.is_none() => Err(Exit::Closed(CloseReason::Shutdown)),
            DRAINING => {
                self.begin_close(Exit::Closed(CloseReason::Shutdown));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_timers(&mut self, now: Instant) -> Result<(), Exit> {
        if self.closing.is_some() {
            return Ok(());
        }
        match &mut self.session {
            None => {
                if self.connect_deadline.is_some_and(|d| now >= d) {
                    return Err(Exit::Timeout("no CONNECT received"));
                }
            }
            Some(active) => {
                if let Some(idle) = active.idle_timeout {
                    if now.saturating_duration_since(self.last_inbound) >= idle {
                        return Err(Exit::Timeout("keep-alive expired"));
                    }
                }
                active.engine.on_tick(now)?;
            }
        }
        Ok(())
    }

    /// Move whatever the QoS engine wants sent into the write buffer.
    fn pump_engine(&mut self) -> Result<(), Exit> {
        let Some(active) = &mut self.session else {
            return Ok(());
        };
        for packet in active.engine.take_outgoing() {
            trace!("-> {:?} to {}", packet.packet_type(), active.handle.client_id());
            self.write_buf.push_packet(&packet)?;
        }
        Ok(())
    }

    /// Write a packet after anything the engine queued earlier.
    fn send(&mut self, packet: &Packet) -> Result<(), Exit> {
        self.pump_engine()?;
        self.write_buf.push_packet(packet)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Exit> {
        let done = self.write_buf.flush_to(&mut self.stream)?;
        if done == self.want_write {
            // flip WRITABLE interest on or off
            let interest = if done {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            self.poll
                .registry()
                .reregister(&mut self.stream, SOCKET, interest)?;
            self.want_write = !done;
        }
        Ok(())
    }

    fn begin_close(&mut self, exit: Exit) {
        if self.closing.is_none() {
            self.closing = Some(Closing {
                exit,
                deadline: Instant::now() + CLOSE_LINGER,
            });
        }
    }

    fn read_socket(&mut self) -> Result<(), Exit> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return match self.closing.take() {
                        Some(closing) => Err(closing.exit),
                        None => Err(Exit::PeerClosed),
                    };
                }
                Ok(n) => {
                    if self.closing.is_some() {
                        // MQTT-3.2.2-5: nothing is processed after a refusal
                        continue;
                    }
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    self.process_input()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Exit::Io(e)),
            }
        }
    }

    fn process_input(&mut self) -> Result<(), Exit> {
        let limit = self.context.config.limits.packet_size_limit();
        while self.closing.is_none() {
            let Some((packet, used)) = decode_packet(&self.read_buf, limit)? else {
                break;
            };
            self.read_buf.advance(used);
            self.last_inbound = Instant::now();
            self.handle_packet(packet)?;
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), Exit> {
        let Some(active) = &mut self.session else {
            return match packet {
                Packet::Connect(connect) => self.handle_connect(connect),
                _ => Err(Exit::Protocol(ProtocolError::FirstPacketNotConnect)),
            };
        };

        trace!("<- {:?} from {}", packet.packet_type(), active.handle.client_id());
        let now = Instant::now();
        match packet {
            Packet::Connect(_) => Err(violation("second CONNECT on one connection")),
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::Puback { packet_id } => {
                active.engine.on_puback(packet_id, now);
                Ok(())
            }
            Packet::Pubrec { packet_id } => {
                active.engine.on_pubrec(packet_id, now);
                Ok(())
            }
            Packet::Pubcomp { packet_id } => {
                active.engine.on_pubcomp(packet_id, now);
                Ok(())
            }
            Packet::Pubrel { packet_id } => {
                let publish = active.engine.on_pubrel(packet_id)?;
                self.context.router.publish(&publish);
                Ok(())
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe),
            Packet::Pingreq => self.send(&Packet::Pingresp),
            Packet::Disconnect => {
                active.will.clear();
                Err(Exit::Disconnect)
            }
            other => Err(Exit::Protocol(ProtocolError::UnexpectedPacket(
                other.packet_type(),
            ))),
        }
    }

    fn refuse(&mut self, code: ConnackCode) -> Result<(), Exit> {
        info!("Refusing CONNECT from {}: {:?}", self.peer, code);
        self.send(&Packet::Connack(Connack {
            session_present: false,
            code,
        }))?;
        self.begin_close(Exit::Refused(code));
        Ok(())
    }

    fn handle_connect(&mut self, connect: Connect) -> Result<(), Exit> {
        let supported = matches!(
            (connect.protocol_name.as_str(), connect.protocol_level),
            ("MQTT", 4) | ("MQIsdp", 3)
        );
        if !supported {
            return self.refuse(ConnackCode::UnacceptableProtocolVersion);
        }

        let config = self.context.config.clone();
        if let Some(will) = &connect.will {
            validate_topic(
                &will.topic,
                config.limits.max_topic_length,
                config.limits.max_topic_levels,
            )?;
            if !is_valid_topic_name(&will.topic) {
                return Err(violation("will topic contains wildcards"));
            }
        }

        let router = self.context.router.clone();
        let grant = match router.registry().create(
            &connect,
            self.control.waker.clone(),
            |client_id| {
                router.remove_client(client_id);
            },
        ) {
            Ok(grant) => grant,
            Err(e) => return self.refuse(e.connack_code()),
        };

        let keep_alive = match connect.keep_alive {
            0 => config.session.default_keep_alive,
            secs => secs,
        };
        let idle_timeout = (keep_alive > 0).then(|| Duration::from_millis(keep_alive as u64 * 1500));

        let now = Instant::now();
        let settings = config.qos_settings();
        let engine = match grant.restored {
            Some(state) => QosEngine::restore(settings, state, now),
            None => QosEngine::new(settings),
        };

        info!(
            "Client {} connected from {} (clean={}, keep_alive={}s, present={})",
            grant.handle.client_id(),
            self.peer,
            connect.clean_session,
            keep_alive,
            grant.session_present
        );

        // CONNACK goes out before any resent or queued delivery
        self.send(&Packet::Connack(Connack {
            session_present: grant.session_present,
            code: ConnackCode::Accepted,
        }))?;
        self.connect_deadline = None;
        self.session = Some(Active {
            handle: grant.handle,
            mailbox: grant.mailbox,
            engine,
            will: PendingWill::new(connect.will),
            idle_timeout,
        });
        Ok(())
    }

    fn handle_publish(&mut self, publish: Publish) -> Result<(), Exit> {
        let limits = &self.context.config.limits;
        validate_topic(&publish.topic, limits.max_topic_length, limits.max_topic_levels)?;
        if !is_valid_topic_name(&publish.topic) {
            return Err(violation(format!(
                "PUBLISH topic '{}' is empty or contains wildcards",
                publish.topic
            )));
        }

        let Some(active) = &mut self.session else {
            return Err(Exit::Protocol(ProtocolError::FirstPacketNotConnect));
        };
        if let Some(publish) = active.engine.on_publish(publish)? {
            self.context.router.publish(&publish);
        }
        Ok(())
    }

    fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<(), Exit> {
        let Some(active) = &mut self.session else {
            return Err(Exit::Protocol(ProtocolError::FirstPacketNotConnect));
        };
        let limits = &self.context.config.limits;
        let client_id = active.handle.client_id().clone();

        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        let mut retained = Vec::new();
        for (filter, qos) in &subscribe.topics {
            let acceptable = is_valid_filter(filter)
                && validate_topic(filter, limits.max_topic_length, limits.max_topic_levels)
                    .is_ok();
            if !acceptable {
                debug!("Rejecting filter '{}' from {}", filter, client_id);
                return_codes.push(SUBACK_FAILURE);
                continue;
            }
            retained.extend(self.context.router.subscribe(&client_id, filter, *qos));
            return_codes.push(*qos as u8);
        }
        debug!("{} subscribed to {} filter(s)", client_id, subscribe.topics.len());

        // MQTT-3.8.4-1: SUBACK precedes the retained messages it unlocks
        self.send(&Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes,
        }))?;
        let now = Instant::now();
        if let Some(active) = &mut self.session {
            for publish in retained {
                active.engine.send(publish, now);
            }
        }
        Ok(())
    }

    fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<(), Exit> {
        let Some(active) = &self.session else {
            return Err(Exit::Protocol(ProtocolError::FirstPacketNotConnect));
        };
        for filter in &unsubscribe.topics {
            self.context
                .router
                .unsubscribe(active.handle.client_id(), filter);
        }
        self.send(&Packet::Unsuback {
            packet_id: unsubscribe.packet_id,
        })
    }

    /// Apply everything other threads posted to this session.
    fn check_mailbox(&mut self) -> Result<(), Exit> {
        let Some(active) = &mut self.session else {
            return Ok(());
        };
        let now = Instant::now();
        let mut close = None;
        for message in active.mailbox.try_iter() {
            match message {
                Outbound::Deliver(publish) => {
                    if publish.qos == QoS::AtMostOnce && self.write_buf.is_congested() {
                        if let Some(n) = self.dropped.record(now) {
                            warn!(
                                "Client {} is not reading, dropped {} QoS 0 message(s)",
                                active.handle.client_id(),
                                n
                            );
                        }
                        continue;
                    }
                    active.engine.send(publish, now);
                }
                Outbound::Inherit(state) => {
                    debug!(
                        "Client {} inherited {} pending deliveries",
                        active.handle.client_id(),
                        state.len()
                    );
                    active.engine.absorb(state, now);
                }
                Outbound::Close(reason) => close = Some(reason),
            }
        }
        match close {
            // the replacement owns the client id now; stop at once
            Some(CloseReason::Takeover) => Err(Exit::Closed(CloseReason::Takeover)),
            Some(CloseReason::Shutdown) => {
                self.begin_close(Exit::Closed(CloseReason::Shutdown));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn teardown(&mut self, exit: &Exit) {
        // best effort for whatever is still buffered
        if !matches!(exit, Exit::Io(_) | Exit::PeerClosed | Exit::Forced) {
            let _ = self.write_buf.flush_to(&mut self.stream);
        }
        let _ = self.poll.registry().deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);

        let Some(active) = self.session.take() else {
            debug!("Connection from {} closed before CONNECT: {:?}", self.peer, exit);
            return;
        };
        let client_id = active.handle.client_id().clone();
        match exit {
            Exit::Disconnect | Exit::Closed(CloseReason::Shutdown) | Exit::PeerClosed => {
                info!("Client {} disconnected ({:?})", client_id, exit)
            }
            _ => warn!("Client {} closed: {:?}", client_id, exit),
        }

        let router = &self.context.router;
        let state = active.engine.into_state();
        let outcome = router.registry().destroy(&active.handle, state, &active.mailbox, |id| {
            router.remove_client(id);
        });
        if outcome == Teardown::Persisted {
            debug!("Stored session for {}", client_id);
        }

        let mut will = active.will;
        if exit.publishes_will() {
            will.fire(router);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_will_policy() {
        assert!(!Exit::Disconnect.publishes_will());
        assert!(!Exit::Closed(CloseReason::Shutdown).publishes_will());
        assert!(!Exit::Forced.publishes_will());
        assert!(!Exit::Refused(ConnackCode::NotAuthorized).publishes_will());

        assert!(Exit::PeerClosed.publishes_will());
        assert!(Exit::Closed(CloseReason::Takeover).publishes_will());
        assert!(Exit::Timeout("keep-alive expired").publishes_will());
        assert!(Exit::Protocol(ProtocolError::FirstPacketNotConnect).publishes_will());
        assert!(Exit::Delivery(QosError::UnknownPubrel(7)).publishes_will());
    }

    #[test]
    fn test_codec_errors_map_to_exit() {
        let exit: Exit = quaymq_core::Error::from(ProtocolError::MalformedHeader).into();
        assert!(matches!(exit, Exit::Protocol(ProtocolError::MalformedHeader)));
    }
}
