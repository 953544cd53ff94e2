//! Session registry.
//!
//! Maps client identifiers to the connection that currently owns them and,
//! for `clean_session = false` clients, to the delivery state kept while they
//! are offline. All transitions happen under one write lock:
//! - a newer CONNECT for the same client id evicts the live session;
//! - a session is marked closed before its mailbox is drained, so no
//!   delivery can slip in after teardown started;
//! - only the connection that still owns an entry may remove it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use mio::Waker;
use parking_lot::{Mutex, RwLock};
use quaymq_core::{ConnackCode, Connect, Publish, QoS};
use thiserror::Error;

use crate::auth::{AuthContext, AuthResult, Authenticator};
use crate::qos::InflightState;

/// Why a CONNECT was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("bad username or password")]
    BadCredentials,
    #[error("not authorized")]
    NotAuthorized,
    #[error("client identifier rejected")]
    IdentifierRejected,
}

impl AuthError {
    pub fn connack_code(self) -> ConnackCode {
        match self {
            AuthError::BadCredentials => ConnackCode::BadUsernamePassword,
            AuthError::NotAuthorized => ConnackCode::NotAuthorized,
            AuthError::IdentifierRejected => ConnackCode::IdentifierRejected,
        }
    }
}

/// Why the broker is closing a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Another connection registered the same client id.
    Takeover,
    /// Broker shutdown.
    Shutdown,
}

/// Messages posted to a connection's mailbox.
#[derive(Debug)]
pub enum Outbound {
    /// Deliver a routed message at the QoS already granted.
    Deliver(Publish),
    /// In-flight state handed over by the connection this one replaced.
    Inherit(InflightState),
    Close(CloseReason),
}

/// Shared handle to a live session, used to reach its connection thread.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: u64,
    client_id: Arc<str>,
    /// True unless the session outlives its connection.
    clean_session: bool,
    sender: Sender<Outbound>,
    waker: Arc<Waker>,
    closed: AtomicBool,
}

impl SessionHandle {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a message and wake the owning connection.
    fn post(&self, message: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        self.push(message)
    }

    fn push(&self, message: Outbound) -> bool {
        if self.sender.send(message).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake connection for {}: {}", self.client_id, e);
        }
        true
    }

    /// Mark closed and tell the connection why.
    fn close(&self, reason: CloseReason) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.push(Outbound::Close(reason));
        }
    }
}

/// A successful CONNECT.
#[derive(Debug)]
pub struct SessionGrant {
    pub handle: Arc<SessionHandle>,
    pub mailbox: Receiver<Outbound>,
    /// Value for the CONNACK session present flag.
    pub session_present: bool,
    /// Stored delivery state to resume.
    pub restored: Option<InflightState>,
    /// True when the client id was generated by the broker.
    pub assigned_id: bool,
}

/// How a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Entry removed together with its subscriptions.
    Removed,
    /// Kept offline for a later `clean_session = false` reconnect.
    Persisted,
    /// A newer connection already owns the client id.
    TakenOver,
}

enum SessionEntry {
    Live(Arc<SessionHandle>),
    Offline {
        state: Mutex<InflightState>,
        since: Instant,
    },
}

/// Registry behaviour switches.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Honour `clean_session = false`.
    pub persistent_sessions: bool,
    /// Offline queue bound per session (0 = unbounded).
    pub max_queued_messages: usize,
    /// How long a stored session waits for its client. `None` keeps it
    /// until the client returns.
    pub offline_expiry: Option<Duration>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            persistent_sessions: true,
            max_queued_messages: 1000,
            offline_expiry: None,
        }
    }
}

/// Client id to session map.
pub struct SessionRegistry {
    sessions: RwLock<AHashMap<Arc<str>, SessionEntry>>,
    authenticator: Arc<dyn Authenticator>,
    settings: RegistrySettings,
    next_session_id: AtomicU64,
    live: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(authenticator: Arc<dyn Authenticator>, settings: RegistrySettings) -> Self {
        Self {
            sessions: RwLock::new(AHashMap::new()),
            authenticator,
            settings,
            next_session_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
        }
    }

    /// Authenticate a CONNECT and register its session.
    ///
    /// `discard_subscriptions` runs under the registry lock when the new
    /// session starts without stored state, so subscriptions left by an
    /// earlier clean session cannot leak into it.
    pub fn create<F>(
        &self,
        connect: &Connect,
        waker: Arc<Waker>,
        discard_subscriptions: F,
    ) -> Result<SessionGrant, AuthError>
    where
        F: FnOnce(&str),
    {
        let ctx = AuthContext {
            client_id: &connect.client_id,
            username: connect.username.as_deref(),
            password: connect.password.as_deref(),
        };
        match self.authenticator.authenticate(&ctx) {
            AuthResult::Allow => {}
            AuthResult::DenyBadCredentials => return Err(AuthError::BadCredentials),
            AuthResult::DenyNotAuthorized => return Err(AuthError::NotAuthorized),
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        // MQTT-3.1.3-7/8: an empty id is only allowed with a clean session
        let assigned_id = connect.client_id.is_empty();
        if assigned_id && !connect.clean_session {
            return Err(AuthError::IdentifierRejected);
        }
        let client_id: Arc<str> = if assigned_id {
            Arc::from(generate_client_id(session_id))
        } else {
            Arc::from(connect.client_id.as_str())
        };

        let clean_session = connect.clean_session || !self.settings.persistent_sessions;
        let (sender, mailbox) = unbounded();
        let handle = Arc::new(SessionHandle {
            session_id,
            client_id: client_id.clone(),
            clean_session,
            sender,
            waker,
            closed: AtomicBool::new(false),
        });

        let mut sessions = self.sessions.write();
        let previous = sessions.insert(client_id.clone(), SessionEntry::Live(handle.clone()));

        let (session_present, restored) = match previous {
            Some(SessionEntry::Live(old)) => {
                info!("Client {} taken over by a new connection", client_id);
                old.close(CloseReason::Takeover);
                // a persistent predecessor forwards its state on teardown
                (!clean_session && !old.clean_session, None)
            }
            Some(SessionEntry::Offline { state, since }) => {
                self.live.fetch_add(1, Ordering::Relaxed);
                if clean_session {
                    (false, None)
                } else if self.is_expired(since, Instant::now()) {
                    debug!("Stored session for {} expired, starting fresh", client_id);
                    (false, None)
                } else {
                    (true, Some(state.into_inner()))
                }
            }
            None => {
                self.live.fetch_add(1, Ordering::Relaxed);
                (false, None)
            }
        };

        if !session_present {
            discard_subscriptions(&*client_id);
        }
        drop(sessions);

        debug!(
            "Session {} created for {} (clean={}, present={})",
            session_id, client_id, clean_session, session_present
        );

        Ok(SessionGrant {
            handle,
            mailbox,
            session_present,
            restored,
            assigned_id,
        })
    }

    /// Tear down a session.
    ///
    /// Marks the handle closed, folds undelivered mailbox messages into
    /// `state`, and then either stores the session offline, removes it
    /// (running `remove_subscriptions` under the lock), or, after a takeover,
    /// hands the state to the new owner.
    pub fn destroy<F>(
        &self,
        handle: &SessionHandle,
        mut state: InflightState,
        mailbox: &Receiver<Outbound>,
        remove_subscriptions: F,
    ) -> Teardown
    where
        F: FnOnce(&str),
    {
        let mut sessions = self.sessions.write();
        handle.closed.store(true, Ordering::Release);

        let persistent = !handle.clean_session;
        for message in mailbox.try_iter() {
            match message {
                Outbound::Deliver(publish) if persistent && publish.qos != QoS::AtMostOnce => {
                    state.enqueue_offline(publish, self.settings.max_queued_messages);
                }
                Outbound::Inherit(inherited) if persistent => merge_state(&mut state, inherited),
                _ => {}
            }
        }

        let client_id = handle.client_id();
        let owner = matches!(
            sessions.get(client_id),
            Some(SessionEntry::Live(current)) if current.session_id == handle.session_id
        );

        if !owner {
            if persistent && !state.is_empty() {
                if let Some(SessionEntry::Live(current)) = sessions.get(client_id) {
                    if !current.clean_session {
                        current.post(Outbound::Inherit(state));
                    }
                }
            }
            return Teardown::TakenOver;
        }

        self.live.fetch_sub(1, Ordering::Relaxed);
        if persistent {
            sessions.insert(
                client_id.clone(),
                SessionEntry::Offline {
                    state: Mutex::new(state),
                    since: Instant::now(),
                },
            );
            Teardown::Persisted
        } else {
            sessions.remove(client_id);
            remove_subscriptions(&**client_id);
            Teardown::Removed
        }
    }

    /// Live session for a client id.
    pub fn find(&self, client_id: &str) -> Option<Arc<SessionHandle>> {
        match self.sessions.read().get(client_id) {
            Some(SessionEntry::Live(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Route a message to a client. Offline persistent sessions keep QoS 1/2
    /// messages; anything else for an absent client is dropped.
    pub fn deliver(&self, client_id: &str, publish: Publish) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(client_id) {
            Some(SessionEntry::Live(handle)) => handle.post(Outbound::Deliver(publish)),
            Some(SessionEntry::Offline { state, .. }) if publish.qos != QoS::AtMostOnce => {
                if !state
                    .lock()
                    .enqueue_offline(publish, self.settings.max_queued_messages)
                {
                    warn!("Offline queue full for {}, dropped oldest message", client_id);
                }
                true
            }
            _ => false,
        }
    }

    /// Close every live session, e.g. on shutdown.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let sessions = self.sessions.read();
        let mut closed = 0;
        for entry in sessions.values() {
            if let SessionEntry::Live(handle) = entry {
                handle.close(reason);
                closed += 1;
            }
        }
        closed
    }

    /// Number of sessions with a connected client.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Number of stored sessions waiting for their client.
    pub fn offline_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|e| matches!(e, SessionEntry::Offline { .. }))
            .count()
    }

    /// Drop stored sessions whose client stayed away past the expiry,
    /// running `remove_subscriptions` for each under the lock.
    pub fn expire_offline<F>(&self, now: Instant, mut remove_subscriptions: F) -> usize
    where
        F: FnMut(&str),
    {
        if self.settings.offline_expiry.is_none() {
            return 0;
        }
        let mut sessions = self.sessions.write();
        let expired: Vec<Arc<str>> = sessions
            .iter()
            .filter_map(|(id, entry)| match entry {
                SessionEntry::Offline { since, .. } if self.is_expired(*since, now) => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        for client_id in &expired {
            sessions.remove(client_id);
            remove_subscriptions(&**client_id);
        }
        if !expired.is_empty() {
            info!("Expired {} offline session(s)", expired.len());
        }
        expired.len()
    }

    fn is_expired(&self, since: Instant, now: Instant) -> bool {
        self.settings
            .offline_expiry
            .is_some_and(|expiry| now.saturating_duration_since(since) >= expiry)
    }
}

fn merge_state(into: &mut InflightState, from: InflightState) {
    into.outbound.extend(from.outbound);
    into.queued.extend(from.queued);
    into.inbound.extend(from.inbound);
}

/// Unique id for a client that connected with an empty one.
pub fn generate_client_id(session_id: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("quaymq-{:016x}-{}", nanos as u64, session_id)
}
