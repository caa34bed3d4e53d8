//! Reliable delivery over the datagram transport.
//!
//! Outbound chat is wrapped in a sequenced envelope and tracked until the
//! peer acknowledges it; a background sweep retransmits anything
//! unacknowledged past the retry timeout. Inbound envelopes are
//! acknowledged immediately and deduplicated per peer.
//!
//! Delivery is at-least-once with duplicate suppression. It is **not**
//! ordered: a later sequence can reach the application before an earlier
//! one that needed a retransmit.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chat_wire::{AckPayload, Message, ReliableEnvelope};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::SessionError;

/// Number of trailing sequence numbers remembered for duplicate suppression
pub const DEDUP_SPAN: u64 = 1024;

/// Bookkeeping for one outstanding reliable send
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// Sequence number assigned at send time
    pub sequence: u64,
    /// Exact encoded datagram, resent verbatim
    pub payload: Bytes,
    /// When the first transmission happened
    pub first_sent_at: Instant,
    /// When the latest transmission happened
    pub sent_at: Instant,
    /// Number of retransmissions so far
    pub retries: u32,
}

/// What one retry sweep decided
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Entries to retransmit, already refreshed in the outbox
    pub resend: Vec<(u64, Bytes)>,
    /// Sequences dropped after the retry ceiling
    pub expired: Vec<u64>,
}

/// Sender-side state for the reliable datagram path.
///
/// Pure bookkeeping: sequence assignment, the pending-send table, and the
/// advisory recovery flag. Socket work lives in [`ReliableSender`], which
/// owns one of these.
#[derive(Debug)]
pub struct ReliableOutbox {
    next_sequence: AtomicU64,
    pending: DashMap<u64, PendingSend>,
    in_recovery: AtomicBool,
    policy: RetryPolicy,
}

impl ReliableOutbox {
    /// Create an empty outbox with the given retry policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            next_sequence: AtomicU64::new(0),
            pending: DashMap::new(),
            in_recovery: AtomicBool::new(false),
            policy,
        }
    }

    /// Wrap chat text in a sequenced envelope and record it as pending.
    ///
    /// Returns the assigned sequence and the encoded datagram to put on the
    /// wire. Sequences are monotonic from 0 for the life of the outbox.
    pub fn wrap_chat(
        &self,
        text: &str,
        sender: &str,
        test_id: Option<&str>,
    ) -> Result<(u64, Bytes), SessionError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let mut envelope = ReliableEnvelope::new(sequence, text);
        if let Some(id) = test_id {
            envelope = envelope.with_test_id(id);
        }

        let message = Message::chat(envelope.to_content()?, sender);
        let payload = Bytes::from(message.encode()?);

        let now = Instant::now();
        self.pending.insert(
            sequence,
            PendingSend {
                sequence,
                payload: payload.clone(),
                first_sent_at: now,
                sent_at: now,
                retries: 0,
            },
        );

        Ok((sequence, payload))
    }

    /// Remove the pending send matching an acknowledged sequence.
    ///
    /// Clears the recovery flag when the table empties. Unknown sequences
    /// (already acknowledged, or dropped at the ceiling) return `None`.
    pub fn acknowledge(&self, sequence: u64) -> Option<PendingSend> {
        let removed = self.pending.remove(&sequence).map(|(_, entry)| entry);
        if removed.is_some() && self.pending.is_empty() {
            self.clear_recovery();
        }
        removed
    }

    /// One retry sweep: refresh and return everything older than the retry
    /// timeout, dropping entries that already hit the ceiling.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.sent_at) >= self.policy.timeout)
            .map(|entry| entry.sequence)
            .collect();

        for sequence in timed_out {
            if let Some(max) = self.policy.max_retries {
                let over_ceiling = self
                    .pending
                    .get(&sequence)
                    .map(|entry| entry.retries >= max)
                    .unwrap_or(false);
                if over_ceiling {
                    self.pending.remove(&sequence);
                    outcome.expired.push(sequence);
                    continue;
                }
            }

            if let Some(mut entry) = self.pending.get_mut(&sequence) {
                entry.retries += 1;
                entry.sent_at = now;
                outcome.resend.push((sequence, entry.payload.clone()));
            }
        }

        if !outcome.resend.is_empty() && !self.in_recovery.swap(true, Ordering::SeqCst) {
            info!(
                "entered recovery: {} unacknowledged sends",
                self.pending.len()
            );
        }
        if self.pending.is_empty() {
            self.clear_recovery();
        }

        outcome
    }

    /// Discard every pending send, for connection teardown.
    ///
    /// Abandoned sends are never retried.
    pub fn abandon_all(&self) -> usize {
        let abandoned = self.pending.len();
        self.pending.clear();
        self.clear_recovery();
        abandoned
    }

    /// Number of unacknowledged sends
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Advisory flag: a retransmission happened and the table has not
    /// emptied since
    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::SeqCst)
    }

    fn clear_recovery(&self) {
        if self.in_recovery.swap(false, Ordering::SeqCst) {
            debug!("left recovery: pending set empty");
        }
    }
}

/// Reliable sender for one datagram peer.
///
/// Owns the outbox and a background retry task that sweeps every
/// [`RetryPolicy::interval`]. Sequences dropped at the retry ceiling are
/// reported on the `expired` channel so the owning transport can tear the
/// peer down.
#[derive(Debug)]
pub struct ReliableSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    outbox: Arc<ReliableOutbox>,
    shutdown_tx: watch::Sender<bool>,
    retry_handle: JoinHandle<()>,
}

impl ReliableSender {
    /// Create a sender and start its retry task
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        policy: RetryPolicy,
        expired_tx: mpsc::UnboundedSender<u64>,
    ) -> Self {
        let outbox = Arc::new(ReliableOutbox::new(policy.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let retry_handle = tokio::spawn(run_retry_loop(
            Arc::clone(&socket),
            peer,
            Arc::clone(&outbox),
            policy,
            expired_tx,
            shutdown_rx,
        ));

        Self {
            socket,
            peer,
            outbox,
            shutdown_tx,
            retry_handle,
        }
    }

    /// Send chat text through the reliability envelope
    pub async fn send_chat(&self, text: &str, sender: &str) -> Result<u64, SessionError> {
        self.send_chat_inner(text, sender, None).await
    }

    /// Send chat text with a probe correlation id attached
    pub async fn send_chat_with_test_id(
        &self,
        text: &str,
        sender: &str,
        test_id: &str,
    ) -> Result<u64, SessionError> {
        self.send_chat_inner(text, sender, Some(test_id)).await
    }

    async fn send_chat_inner(
        &self,
        text: &str,
        sender: &str,
        test_id: Option<&str>,
    ) -> Result<u64, SessionError> {
        let (sequence, payload) = self.outbox.wrap_chat(text, sender, test_id)?;

        if let Err(e) = self.socket.send_to(&payload, self.peer).await {
            // Socket is presumed broken; the entry would never be delivered
            self.outbox.acknowledge(sequence);
            return Err(SessionError::SendFailure(e));
        }

        debug!("sent reliable chat: peer={} sequence={}", self.peer, sequence);
        Ok(sequence)
    }

    /// Process an inbound acknowledgement for this peer.
    ///
    /// Returns true when a pending send was cleared.
    pub fn process_ack(&self, ack: &AckPayload) -> bool {
        match self.outbox.acknowledge(ack.sequence) {
            Some(entry) => {
                debug!(
                    "acknowledged: peer={} sequence={} retries={}",
                    self.peer, ack.sequence, entry.retries
                );
                if let Some(test_id) = &ack.test_id {
                    debug!(
                        "reliable probe round trip: test_id={} rtt={:?}",
                        test_id,
                        entry.first_sent_at.elapsed()
                    );
                }
                true
            }
            None => {
                debug!(
                    "ack for unknown sequence: peer={} sequence={}",
                    self.peer, ack.sequence
                );
                false
            }
        }
    }

    /// Number of unacknowledged sends
    pub fn pending_len(&self) -> usize {
        self.outbox.pending_len()
    }

    /// Advisory recovery flag
    pub fn in_recovery(&self) -> bool {
        self.outbox.in_recovery()
    }

    /// Stop the retry task and abandon all pending sends
    pub fn shutdown(&self) {
        self.shutdown_tx.send(true).ok();
        let abandoned = self.outbox.abandon_all();
        if abandoned > 0 {
            debug!(
                "abandoned {} pending sends: peer={}",
                abandoned, self.peer
            );
        }
    }
}

impl Drop for ReliableSender {
    fn drop(&mut self) {
        self.retry_handle.abort();
    }
}

async fn run_retry_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    outbox: Arc<ReliableOutbox>,
    policy: RetryPolicy,
    expired_tx: mpsc::UnboundedSender<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sweep = interval(policy.interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                break;
            }

            _ = sweep.tick() => {
                let outcome = outbox.sweep(Instant::now());

                for sequence in outcome.expired {
                    warn!(
                        "retry ceiling reached, dropping send: peer={} sequence={}",
                        peer, sequence
                    );
                    expired_tx.send(sequence).ok();
                }

                for (sequence, payload) in outcome.resend {
                    match socket.send_to(&payload, peer).await {
                        Ok(_) => {
                            debug!("retransmitted: peer={} sequence={}", peer, sequence);
                        }
                        Err(e) => {
                            warn!(
                                "retransmit failed: peer={} sequence={} error={}",
                                peer, sequence, e
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Receiver-side duplicate suppression for one peer's reliable stream.
///
/// Remembers recently seen sequence numbers; anything older than the
/// retained span is assumed already delivered, so a long-delayed
/// retransmit cannot reach the application twice.
#[derive(Debug)]
pub struct DedupWindow {
    seen: BTreeSet<u64>,
    span: u64,
    max_seen: Option<u64>,
}

impl DedupWindow {
    /// Window remembering the default span of trailing sequences
    pub fn new() -> Self {
        Self::with_span(DEDUP_SPAN)
    }

    /// Window remembering `span` trailing sequences
    pub fn with_span(span: u64) -> Self {
        Self {
            seen: BTreeSet::new(),
            span,
            max_seen: None,
        }
    }

    /// Record a sequence sighting; true when it should be delivered
    pub fn observe(&mut self, sequence: u64) -> bool {
        if let Some(max_seen) = self.max_seen {
            let horizon = max_seen.saturating_sub(self.span);
            if sequence < horizon {
                return false;
            }
        }

        if !self.seen.insert(sequence) {
            return false;
        }

        let max_seen = self.max_seen.map_or(sequence, |m| m.max(sequence));
        self.max_seen = Some(max_seen);
        let horizon = max_seen.saturating_sub(self.span);
        while let Some(&lowest) = self.seen.first() {
            if lowest >= horizon {
                break;
            }
            self.seen.remove(&lowest);
        }

        true
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode the immediate acknowledgement for a received envelope
pub fn encode_ack(envelope: &ReliableEnvelope, identity: &str) -> Result<Vec<u8>, SessionError> {
    let payload = AckPayload::for_envelope(envelope);
    let message = Message::ack(payload.to_content()?, Some(identity.to_string()));
    Ok(message.encode()?)
}
