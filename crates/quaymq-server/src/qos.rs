//! Per-connection QoS delivery engine.
//!
//! The engine owns every in-flight delivery record for one connection and
//! never touches a socket. Callers feed it received packets and the current
//! time; it queues the packets that must go out in an outbox drained with
//! [`QosEngine::take_outgoing`]. Retransmission deadlines live inside the
//! records, so completing a record also cancels its timer.
//!
//! Outbound flows:
//! - QoS 0: written once, nothing retained.
//! - QoS 1: `AwaitingPubAck` until PUBACK.
//! - QoS 2: `AwaitingPubRec` until PUBREC (PUBREL sent), then
//!   `AwaitingPubComp` until PUBCOMP.
//!
//! Inbound QoS 2 messages are held as `AwaitingPubRel` and released to the
//! router exactly once when PUBREL arrives.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::{debug, warn};
use quaymq_core::{Packet, Publish, QoS};
use thiserror::Error;

use crate::packet_id::PacketIdAllocator;

/// Default time to wait for an acknowledgement before retransmitting.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default number of unacknowledged QoS 1/2 deliveries per connection.
pub const DEFAULT_MAX_INFLIGHT: usize = 50;

/// Fatal delivery errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QosError {
    #[error("PUBREL for packet {0} with no message awaiting release")]
    UnknownPubrel(u16),

    #[error("QoS {0:?} PUBLISH without a packet identifier")]
    MissingPacketId(QoS),

    #[error("packet {packet_id} unacknowledged after {retries} retransmissions")]
    RetryLimitExceeded { packet_id: u16, retries: u32 },
}

/// Engine tuning.
#[derive(Debug, Clone, Copy)]
pub struct QosSettings {
    pub ack_timeout: Duration,
    /// Ceiling on outbound QoS 1/2 records not yet complete.
    pub max_inflight: usize,
    /// Retransmissions allowed per record; 0 retries forever.
    pub max_retries: u32,
}

impl Default for QosSettings {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_retries: 0,
        }
    }
}

/// Stage of an outbound QoS 1/2 delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStage {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

#[derive(Debug, Clone)]
struct InflightRecord {
    packet_id: u16,
    publish: Publish,
    stage: OutboundStage,
    retries: u32,
    last_sent: Instant,
}

impl InflightRecord {
    fn deadline(&self, ack_timeout: Duration) -> Instant {
        self.last_sent + ack_timeout
    }

    /// The control packet a timeout resends.
    fn retransmission(&self) -> Packet {
        match self.stage {
            OutboundStage::AwaitingPubComp => Packet::Pubrel {
                packet_id: self.packet_id,
            },
            _ => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
        }
    }
}

/// Delivery state that outlives a connection for persistent sessions.
#[derive(Debug, Clone, Default)]
pub struct InflightState {
    /// Unacknowledged outbound deliveries in original send order.
    pub outbound: Vec<(Publish, OutboundStage)>,
    /// Deliveries that never got a window slot.
    pub queued: VecDeque<Publish>,
    /// Inbound QoS 2 messages still awaiting PUBREL.
    pub inbound: Vec<Publish>,
}

impl InflightState {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.queued.is_empty() && self.inbound.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outbound.len() + self.queued.len()
    }

    /// Queue a delivery that arrived while the client was offline, dropping
    /// the oldest queued message once `limit` is reached (0 = unbounded).
    pub fn enqueue_offline(&mut self, publish: Publish, limit: usize) -> bool {
        let mut dropped = false;
        if limit > 0 {
            while self.len() >= limit && self.queued.pop_front().is_some() {
                dropped = true;
            }
            if self.len() >= limit {
                return false;
            }
        }
        self.queued.push_back(publish);
        !dropped
    }
}

/// Outbound work waiting for a window slot.
#[derive(Debug, Clone)]
enum Pending {
    /// A PUBLISH to transmit. A packet id set here is the one it was last
    /// sent under; it is reused with DUP when still free.
    Deliver(Publish),
    /// A QoS 2 delivery the client already answered with PUBREC; only the
    /// PUBREL is outstanding.
    Release(Publish),
}

/// QoS state machine for a single connection.
#[derive(Debug)]
pub struct QosEngine {
    settings: QosSettings,
    ids: PacketIdAllocator,
    /// Outbound records in send order.
    inflight: VecDeque<InflightRecord>,
    /// Sends waiting for a window slot.
    queued: VecDeque<Pending>,
    /// Inbound QoS 2 messages awaiting PUBREL, by packet id.
    awaiting_pubrel: AHashMap<u16, Publish>,
    outbox: Vec<Packet>,
}

impl QosEngine {
    pub fn new(settings: QosSettings) -> Self {
        Self {
            settings,
            ids: PacketIdAllocator::new(),
            inflight: VecDeque::new(),
            queued: VecDeque::new(),
            awaiting_pubrel: AHashMap::new(),
            outbox: Vec::new(),
        }
    }

    /// Rebuild an engine from a stored session and queue the resends
    /// MQTT-4.4.0-1 requires: PUBLISH with DUP set, or PUBREL.
    pub fn restore(settings: QosSettings, state: InflightState, now: Instant) -> Self {
        let mut engine = Self::new(settings);
        engine.absorb(state, now);
        engine
    }

    /// Take over stored delivery state, e.g. from a connection this one
    /// replaced.
    ///
    /// Stored records are resent while the window has room, under their old
    /// packet id when it is free here and a fresh one otherwise. The rest
    /// wait ahead of anything already queued, in their original order.
    pub fn absorb(&mut self, state: InflightState, now: Instant) {
        let mut waiting = Vec::new();
        for (publish, stage) in state.outbound {
            let pending = match stage {
                OutboundStage::AwaitingPubComp => Pending::Release(publish),
                _ => Pending::Deliver(publish),
            };
            if self.has_free_slot() {
                self.dispatch(pending, now);
            } else {
                waiting.push(pending);
            }
        }
        for pending in waiting.into_iter().rev() {
            self.queued.push_front(pending);
        }

        for publish in state.inbound {
            if let Some(packet_id) = publish.packet_id {
                self.awaiting_pubrel.entry(packet_id).or_insert(publish);
            }
        }

        self.queued
            .extend(state.queued.into_iter().map(Pending::Deliver));
        self.fill_window(now);
    }

    /// Send a message to the client. QoS 0 goes out immediately; QoS 1/2
    /// takes a window slot or waits in FIFO order for one.
    pub fn send(&mut self, mut publish: Publish, now: Instant) {
        publish.dup = false;
        publish.packet_id = None;
        if publish.qos == QoS::AtMostOnce {
            self.outbox.push(Packet::Publish(publish));
            return;
        }

        if self.queued.is_empty() && self.has_free_slot() {
            self.transmit(publish, now);
        } else {
            debug!(
                "In-flight window full ({}), queueing delivery to {}",
                self.inflight.len(),
                publish.topic
            );
            self.queued.push_back(Pending::Deliver(publish));
        }
    }

    /// PUBACK for an outbound QoS 1 delivery.
    pub fn on_puback(&mut self, packet_id: u16, now: Instant) -> bool {
        self.complete(packet_id, OutboundStage::AwaitingPubAck, now)
    }

    /// PUBREC for an outbound QoS 2 delivery. Answers with PUBREL, including
    /// for a duplicate PUBREC after the first one was handled.
    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> bool {
        let Some(record) = self.inflight.iter_mut().find(|r| r.packet_id == packet_id) else {
            warn!("PUBREC for unknown packet id {}", packet_id);
            return false;
        };
        match record.stage {
            OutboundStage::AwaitingPubRec | OutboundStage::AwaitingPubComp => {
                record.stage = OutboundStage::AwaitingPubComp;
                record.retries = 0;
                record.last_sent = now;
                self.outbox.push(Packet::Pubrel { packet_id });
                true
            }
            OutboundStage::AwaitingPubAck => {
                warn!("PUBREC for QoS 1 delivery {}", packet_id);
                false
            }
        }
    }

    /// PUBCOMP for an outbound QoS 2 delivery.
    pub fn on_pubcomp(&mut self, packet_id: u16, now: Instant) -> bool {
        self.complete(packet_id, OutboundStage::AwaitingPubComp, now)
    }

    /// A PUBLISH from the client. Returns the message to route now, if any.
    ///
    /// QoS 2 messages are held until PUBREL; a retransmission of one already
    /// held only repeats the PUBREC.
    pub fn on_publish(&mut self, publish: Publish) -> Result<Option<Publish>, QosError> {
        match publish.qos {
            QoS::AtMostOnce => Ok(Some(publish)),
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(QosError::MissingPacketId(publish.qos))?;
                self.outbox.push(Packet::Puback { packet_id });
                Ok(Some(publish))
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(QosError::MissingPacketId(publish.qos))?;
                if self.awaiting_pubrel.contains_key(&packet_id) {
                    debug!("Duplicate QoS 2 PUBLISH {}, repeating PUBREC", packet_id);
                } else {
                    self.awaiting_pubrel.insert(packet_id, publish);
                }
                self.outbox.push(Packet::Pubrec { packet_id });
                Ok(None)
            }
        }
    }

    /// PUBREL from the client: releases the held message exactly once.
    pub fn on_pubrel(&mut self, packet_id: u16) -> Result<Publish, QosError> {
        let publish = self
            .awaiting_pubrel
            .remove(&packet_id)
            .ok_or(QosError::UnknownPubrel(packet_id))?;
        self.outbox.push(Packet::Pubcomp { packet_id });
        Ok(publish)
    }

    /// Retransmit every record whose acknowledgement is overdue, once each,
    /// and restart its timer.
    pub fn on_tick(&mut self, now: Instant) -> Result<(), QosError> {
        let ack_timeout = self.settings.ack_timeout;
        for record in self.inflight.iter_mut() {
            if record.deadline(ack_timeout) > now {
                continue;
            }
            if self.settings.max_retries > 0 && record.retries >= self.settings.max_retries {
                return Err(QosError::RetryLimitExceeded {
                    packet_id: record.packet_id,
                    retries: record.retries,
                });
            }
            record.retries += 1;
            record.last_sent = now;
            debug!(
                "Ack timeout for packet {} ({:?}), retransmission {}",
                record.packet_id, record.stage, record.retries
            );
            self.outbox.push(record.retransmission());
        }
        Ok(())
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let ack_timeout = self.settings.ack_timeout;
        self.inflight.iter().map(|r| r.deadline(ack_timeout)).min()
    }

    /// Packets generated since the last call, in the order they must be written.
    pub fn take_outgoing(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn stage(&self, packet_id: u16) -> Option<OutboundStage> {
        self.inflight
            .iter()
            .find(|r| r.packet_id == packet_id)
            .map(|r| r.stage)
    }

    /// Hand over everything not yet complete, leaving the engine empty.
    /// Packets still in the outbox are discarded.
    pub fn into_state(mut self) -> InflightState {
        let mut outbound: Vec<(Publish, OutboundStage)> = self
            .inflight
            .drain(..)
            .map(|r| (r.publish, r.stage))
            .collect();
        let mut queued = VecDeque::new();
        for pending in self.queued.drain(..) {
            match pending {
                Pending::Deliver(publish) => queued.push_back(publish),
                Pending::Release(publish) => {
                    outbound.push((publish, OutboundStage::AwaitingPubComp))
                }
            }
        }
        let mut inbound: Vec<Publish> = self.awaiting_pubrel.drain().map(|(_, p)| p).collect();
        inbound.sort_by_key(|p| p.packet_id);
        InflightState {
            outbound,
            queued,
            inbound,
        }
    }

    fn has_free_slot(&self) -> bool {
        self.inflight.len() < self.settings.max_inflight.max(1)
    }

    fn dispatch(&mut self, pending: Pending, now: Instant) {
        match pending {
            Pending::Deliver(publish) => self.transmit(publish, now),
            Pending::Release(publish) => self.release(publish, now),
        }
    }

    /// Keep the id a stored message was sent under if it is free, otherwise
    /// take a new one.
    fn claim_id(&mut self, previous: Option<u16>) -> Option<(u16, bool)> {
        if let Some(id) = previous {
            if self.ids.reserve(id) {
                return Some((id, true));
            }
            debug!("Packet id {} already in use, resending under a new id", id);
        }
        self.ids.allocate().map(|id| (id, false))
    }

    fn transmit(&mut self, mut publish: Publish, now: Instant) {
        let Some((packet_id, resend)) = self.claim_id(publish.packet_id) else {
            self.queued.push_front(Pending::Deliver(publish));
            return;
        };
        publish.packet_id = Some(packet_id);
        publish.dup = resend;
        let stage = if publish.qos == QoS::ExactlyOnce {
            OutboundStage::AwaitingPubRec
        } else {
            OutboundStage::AwaitingPubAck
        };
        self.outbox.push(Packet::Publish(publish.clone()));
        self.inflight.push_back(InflightRecord {
            packet_id,
            publish,
            stage,
            retries: 0,
            last_sent: now,
        });
    }

    fn release(&mut self, mut publish: Publish, now: Instant) {
        let Some((packet_id, _)) = self.claim_id(publish.packet_id) else {
            self.queued.push_front(Pending::Release(publish));
            return;
        };
        publish.packet_id = Some(packet_id);
        self.outbox.push(Packet::Pubrel { packet_id });
        self.inflight.push_back(InflightRecord {
            packet_id,
            publish,
            stage: OutboundStage::AwaitingPubComp,
            retries: 0,
            last_sent: now,
        });
    }

    fn complete(&mut self, packet_id: u16, expected: OutboundStage, now: Instant) -> bool {
        let Some(pos) = self
            .inflight
            .iter()
            .position(|r| r.packet_id == packet_id && r.stage == expected)
        else {
            warn!(
                "Acknowledgement for packet id {} not in {:?}, ignoring",
                packet_id, expected
            );
            return false;
        };
        self.inflight.remove(pos);
        self.ids.release(packet_id);
        self.fill_window(now);
        true
    }

    fn fill_window(&mut self, now: Instant) {
        while self.has_free_slot() {
            let Some(pending) = self.queued.pop_front() else {
                break;
            };
            self.dispatch(pending, now);
            if self.ids.in_use_count() >= u16::MAX as usize {
                break;
            }
        }
    }
}
