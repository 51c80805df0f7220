//! Pairing state machine.
//!
//! Drives one device at a time from `Unpaired` to `Paired`: discovery
//! broadcast, alive check, pairing broadcast burst, priority-address
//! exchange, challenge exchange, then the serialized identity harvest.
//! A device may instead push its own challenge right after discovery; the
//! machine then forks to the key-push branch (`0x32` wrapped key transfer,
//! MAC answer, `0x33` ack) before harvesting identity.
//!
//! The machine is synchronous and clock-explicit: every entry point takes
//! `now` so tests can replay any schedule. The retry slot is a tagged
//! [`PendingOp`] value with its prebuilt frame rather than a stored closure,
//! so the retry state is inspectable.

use crate::constants::*;
use crate::crypto::{self, CHALLENGE_LEN};
use crate::device::PairingState;
use crate::error::GatewayError;
use crate::message::Message;
use crate::packet::{Address, Command, Frame};
use crate::radio::{RadioTransport, TxRequest};
use crate::registry::DeviceRegistry;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the retry slot would send again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    Discover,
    AliveCheck,
    PairingBroadcast { remaining: u8 },
    PriorityAddrRequest,
    Challenge,
    KeyTransfer,
    ChallengeAnswer,
    AskChallenge,
    NameRequest,
    GeneralInfo1Request,
    GeneralInfo2Request,
}

/// One outbound frame awaiting submission, retry, or a reply.
#[derive(Debug, Clone)]
struct PendingSend {
    op: PendingOp,
    tx: TxRequest,
    attempts: u8,
    next_at: Instant,
}

impl PendingSend {
    fn new(op: PendingOp, tx: TxRequest, next_at: Instant) -> Self {
        PendingSend {
            op,
            tx,
            attempts: 0,
            next_at,
        }
    }
}

struct Session {
    addr: Address,
    pending: Option<PendingSend>,
    last_step_at: Instant,
    last_wait_log: Option<Instant>,
    /// Nonce we sent in our `0x3C`.
    our_challenge: Option<[u8; CHALLENGE_LEN]>,
    /// Frame bytes of the `0x32` we sent, kept for the MAC answer.
    key_transfer_frame: Option<Vec<u8>>,
    not_ready_count: u8,
}

impl Session {
    fn new(addr: Address, now: Instant) -> Self {
        Session {
            addr,
            pending: None,
            last_step_at: now,
            last_wait_log: None,
            our_challenge: None,
            key_transfer_frame: None,
            not_ready_count: 0,
        }
    }
}

pub struct PairingEngine {
    controller: Address,
    transfer_key: [u8; 16],
    system_key: Option<[u8; 16]>,
    auto_pair: bool,
    session: Option<Session>,
    /// Why the last session aborted on a peer refusal, for the operator
    /// surface.
    last_failure: Option<GatewayError>,
}

impl PairingEngine {
    pub fn new(controller: Address, transfer_key: [u8; 16]) -> Self {
        PairingEngine {
            controller,
            transfer_key,
            system_key: None,
            auto_pair: false,
            session: None,
            last_failure: None,
        }
    }

    pub fn set_system_key(&mut self, key: [u8; 16]) {
        self.system_key = Some(key);
    }

    pub fn set_auto_pair(&mut self, enabled: bool) {
        self.auto_pair = enabled;
        info!(enabled, "auto-pair mode");
    }

    pub fn auto_pair(&self) -> bool {
        self.auto_pair
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn current_address(&self) -> Option<Address> {
        self.session.as_ref().map(|s| s.addr)
    }

    /// Peer refusal that ended the most recent session, if any.
    pub fn last_failure(&self) -> Option<&GatewayError> {
        self.last_failure.as_ref()
    }

    /// Inspectable retry slot.
    pub fn pending_op(&self) -> Option<&PendingOp> {
        self.session
            .as_ref()
            .and_then(|s| s.pending.as_ref())
            .map(|p| &p.op)
    }

    /// Open a session for `addr`. Fails when a session is live, when another
    /// device sits in a non-terminal state, or without a configured system key.
    pub fn start(
        &mut self,
        addr: Address,
        registry: &mut DeviceRegistry,
        now: Instant,
    ) -> Result<(), GatewayError> {
        if let Some(session) = &self.session {
            return Err(GatewayError::PairingBusy(session.addr));
        }
        if self.system_key.is_none() {
            return Err(GatewayError::SystemKeyMissing);
        }
        registry.begin_pairing(addr, now)?;
        self.last_failure = None;

        let mut session = Session::new(addr, now);
        let frame = Frame::broadcast(self.controller, Command::Discover, &[])
            .with_lpm()
            .with_prio();
        session.pending = Some(PendingSend::new(
            PendingOp::Discover,
            TxRequest::long(frame, POST_BROADCAST_DELAY),
            now,
        ));
        self.session = Some(session);
        info!(%addr, "pairing started, broadcasting discovery");
        Ok(())
    }

    /// Adopt an unsolicited discovery answer as a fresh auto-pair session;
    /// the device already answered discovery, so it enters at alive-check.
    pub fn adopt(
        &mut self,
        addr: Address,
        registry: &mut DeviceRegistry,
        radio: &mut dyn RadioTransport,
        now: Instant,
    ) -> Result<(), GatewayError> {
        if let Some(session) = &self.session {
            return Err(GatewayError::PairingBusy(session.addr));
        }
        if self.system_key.is_none() {
            return Err(GatewayError::SystemKeyMissing);
        }
        registry.begin_pairing(addr, now)?;
        self.last_failure = None;
        self.session = Some(Session::new(addr, now));
        info!(%addr, "auto-pair adopted discovery answer");
        self.enter_alive_check(registry, now);
        self.pump(registry, radio, now);
        Ok(())
    }

    /// Operator cancel: revert the device, clear the address, drop the
    /// retry slot.
    pub fn cancel(&mut self, registry: &mut DeviceRegistry) {
        if let Some(session) = self.session.take() {
            if let Some(device) = registry.get_mut(session.addr) {
                device.pairing_state = PairingState::Unpaired;
                device.pairing_started_at = None;
            }
            info!(addr = %session.addr, "pairing cancelled");
        }
    }

    /// Periodic drive: umbrella timeout, due submissions and retries,
    /// advisory step logging.
    pub fn process(
        &mut self,
        registry: &mut DeviceRegistry,
        radio: &mut dyn RadioTransport,
        now: Instant,
    ) {
        let Some(addr) = self.current_address() else {
            return;
        };

        let timed_out = registry
            .get(addr)
            .map(|d| d.pairing_timed_out(now))
            .unwrap_or(true);
        if timed_out {
            warn!(%addr, "pairing timeout");
            registry.fail_pairing(addr, now);
            self.session = None;
            return;
        }

        self.pump(registry, radio, now);

        let session = self.session.as_mut().expect("session lives past pump");
        if session.pending.is_none() && now.duration_since(session.last_step_at) > STEP_WAIT {
            let due = session
                .last_wait_log
                .map(|t| now.duration_since(t) > STEP_WAIT)
                .unwrap_or(true);
            if due {
                session.last_wait_log = Some(now);
                let state = registry.get(addr).map(|d| d.pairing_state);
                info!(%addr, ?state, "still waiting for device response");
            }
        }
    }

    /// Submit the pending frame when due and the radio is free. A refused
    /// send never advances anything; the next tick retries it.
    fn pump(&mut self, registry: &mut DeviceRegistry, radio: &mut dyn RadioTransport, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let addr = session.addr;
        let mut broadcast_done = false;

        if let Some(pending) = &mut session.pending {
            let unbounded = matches!(
                pending.op,
                PendingOp::Discover | PendingOp::PairingBroadcast { .. }
            );
            if now >= pending.next_at && (unbounded || pending.attempts < RETRY_BUDGET) {
                if radio.state().is_busy() {
                    debug!(%addr, op = ?pending.op, "radio busy, deferring send");
                } else {
                    match radio.submit(pending.tx.clone()) {
                        Ok(()) => {
                            pending.attempts += 1;
                            match &mut pending.op {
                                PendingOp::Discover => {
                                    pending.next_at = now + DISCOVERY_RETRY_INTERVAL;
                                    // Roughly one line per second at the 500 ms cadence.
                                    if pending.attempts % 2 == 1 {
                                        info!(%addr, attempt = pending.attempts,
                                              "discovery broadcast, waiting for answer");
                                    }
                                }
                                PendingOp::PairingBroadcast { remaining } => {
                                    *remaining -= 1;
                                    debug!(%addr, remaining = *remaining, "pairing broadcast");
                                    if *remaining == 0 {
                                        broadcast_done = true;
                                    } else {
                                        pending.next_at = now + PAIRING_BROADCAST_INTERVAL;
                                    }
                                }
                                _ => {
                                    pending.next_at =
                                        now + RETRY_BASE_DELAY * u32::from(pending.attempts);
                                }
                            }
                        }
                        Err(err) => {
                            debug!(%addr, %err, "radio refused send, will retry");
                        }
                    }
                }
            }
        }

        if broadcast_done {
            // Four copies out; advance unconditionally.
            self.set_state(registry, PairingState::AwaitingPriorityAddr, now);
            let frame = Frame::targeted(self.controller, addr, Command::PriorityAddrRequest, &[])
                .with_prio();
            self.queue(PendingOp::PriorityAddrRequest, TxRequest::short(frame), now);
            self.pump(registry, radio, now);
        }
    }

    /// Feed a frame from the device under pairing. Returns true when the
    /// frame belonged to the session.
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        registry: &mut DeviceRegistry,
        radio: &mut dyn RadioTransport,
        now: Instant,
    ) -> bool {
        let Some(addr) = self.current_address() else {
            return false;
        };
        if frame.source != addr {
            return false;
        }

        let message = match Message::try_from(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(%addr, %err, "dropping malformed frame during pairing");
                return true;
            }
        };

        let state = match registry.get_mut(addr) {
            Some(device) => {
                device.touch(now);
                device.pairing_state
            }
            None => return false,
        };

        if !matches!(message, Message::Error { .. }) {
            let session = self.session.as_mut().expect("session checked above");
            session.not_ready_count = 0;
            session.last_step_at = now;
        }

        match message {
            Message::DiscoverAnswer(answer) if state == PairingState::Discovering => {
                registry.update_from_discovery(addr, &answer, now);
                info!(%addr, node_type = answer.node_type, "device answered discovery");
                self.enter_alive_check(registry, now);
            }
            Message::AliveOk if state == PairingState::AliveCheck => {
                debug!(%addr, "alive check confirmed");
                self.set_state(registry, PairingState::Broadcasting2A, now);
                let frame = Frame::broadcast(
                    self.controller,
                    Command::PairingBroadcast,
                    &PAIRING_BROADCAST_PAYLOAD,
                )
                .with_lpm();
                self.queue(
                    PendingOp::PairingBroadcast {
                        remaining: PAIRING_BROADCAST_REPEATS,
                    },
                    TxRequest::long(frame, POST_BROADCAST_DELAY),
                    now,
                );
            }
            Message::PriorityAddrAnswer { addr: prio }
                if state == PairingState::AwaitingPriorityAddr =>
            {
                debug!(%addr, prio = %hex::encode(&prio), "priority address learned");
                if let Some(device) = registry.get_mut(addr) {
                    device.priority_addr = Some(prio.to_vec());
                }
                let challenge: [u8; CHALLENGE_LEN] = rand::random();
                let session = self.session.as_mut().expect("session checked above");
                session.our_challenge = Some(challenge);
                registry.store_challenge(addr, &challenge, now);
                self.set_state(registry, PairingState::ChallengeSent, now);
                let frame = Frame::targeted(self.controller, addr, Command::Challenge, &challenge);
                self.queue(PendingOp::Challenge, TxRequest::short(frame), now);
            }
            Message::ChallengeAnswer { mac } if state == PairingState::ChallengeSent => {
                // Not verified cryptographically at this step: answering at
                // all proves the device processed the exchange.
                debug!(%addr, mac = %hex::encode(mac), "challenge answered");
                let session = self.session.as_ref().expect("session checked above");
                if let (Some(nonce), Some(key)) = (session.our_challenge, self.system_key) {
                    let session_key = crypto::session_key_2w(
                        &nonce,
                        &key,
                        &[u8::from(Command::ChallengeAnswer)],
                    );
                    registry.store_session_key(addr, &session_key, now);
                }
                self.install_key_and_harvest(registry, now);
            }
            Message::PairingConfirm => {
                // Legacy flow: the peer confirms and expects us to ask for a
                // challenge with 0x31.
                info!(%addr, "pairing confirmation, asking for challenge");
                self.set_state(registry, PairingState::AskingChallenge, now);
                let frame = Frame::targeted(self.controller, addr, Command::AskChallenge, &[]);
                self.queue(PendingOp::AskChallenge, TxRequest::short(frame), now);
            }
            Message::Challenge { challenge } => {
                self.handle_device_challenge(challenge, registry, now);
            }
            Message::KeyTransferAck => {
                info!(%addr, "key transfer acknowledged");
                self.install_key_and_harvest(registry, now);
            }
            Message::NameAnswer { name } if state == PairingState::KeyExchanged => {
                debug!(%addr, name = %name, "device name learned");
                registry.update_name(addr, &name, now);
                let frame =
                    Frame::targeted(self.controller, addr, Command::GeneralInfo1Request, &[]);
                self.queue(PendingOp::GeneralInfo1Request, TxRequest::short(frame), now);
            }
            Message::GeneralInfo1Answer { info } if state == PairingState::KeyExchanged => {
                registry.update_general_info1(addr, &info, now);
                let frame =
                    Frame::targeted(self.controller, addr, Command::GeneralInfo2Request, &[]);
                self.queue(PendingOp::GeneralInfo2Request, TxRequest::short(frame), now);
            }
            Message::GeneralInfo2Answer { info } if state == PairingState::KeyExchanged => {
                registry.update_general_info2(addr, &info, now);
                registry.complete_pairing(addr, now);
                info!(%addr, "pairing completed");
                self.session = None;
                return true;
            }
            Message::Error { status } => {
                self.handle_error_status(status, registry, now);
            }
            other => {
                debug!(%addr, ?other, ?state, "ignoring unexpected frame during pairing");
            }
        }

        self.pump(registry, radio, now);
        true
    }

    /// Unsolicited discovery answer while idle in auto-pair mode.
    pub fn maybe_auto_adopt(
        &mut self,
        frame: &Frame,
        registry: &mut DeviceRegistry,
        radio: &mut dyn RadioTransport,
        now: Instant,
    ) -> bool {
        if !self.auto_pair || self.session.is_some() {
            return false;
        }
        let Ok(Message::DiscoverAnswer(answer)) = Message::try_from(frame) else {
            return false;
        };
        registry.update_from_discovery(frame.source, &answer, now);
        match self.adopt(frame.source, registry, radio, now) {
            Ok(()) => true,
            Err(err) => {
                warn!(addr = %frame.source, %err, "auto-pair adoption refused");
                false
            }
        }
    }

    fn enter_alive_check(&mut self, registry: &mut DeviceRegistry, now: Instant) {
        let Some(addr) = self.current_address() else {
            return;
        };
        self.set_state(registry, PairingState::AliveCheck, now);
        let frame = Frame::targeted(self.controller, addr, Command::AliveCheck, &[]);
        self.queue(PendingOp::AliveCheck, TxRequest::short(frame), now);
    }

    /// Key-push branch: the device hands us a challenge. The first one
    /// triggers the wrapped key transfer; the next one authenticates it.
    fn handle_device_challenge(
        &mut self,
        challenge: [u8; CHALLENGE_LEN],
        registry: &mut DeviceRegistry,
        now: Instant,
    ) {
        let Some(addr) = self.current_address() else {
            return;
        };
        let Some(system_key) = self.system_key else {
            warn!(%addr, "device challenge without configured system key");
            return;
        };
        registry.store_challenge(addr, &challenge, now);

        let already_sent = self
            .session
            .as_ref()
            .map(|s| s.key_transfer_frame.is_some())
            .unwrap_or(false);

        if !already_sent {
            // Wrap against the preceding ask-challenge byte and this nonce.
            // The keystream block the wrap used stays behind as the stack key.
            let wrap_frame = [u8::from(Command::AskChallenge)];
            let wrapped = crypto::wrap_key(&system_key, &challenge, &wrap_frame, &self.transfer_key);
            let pad = crypto::transfer_pad(&challenge, &wrap_frame, &self.transfer_key);
            registry.store_stack_key(addr, &pad, now);
            let mut frame_bytes = vec![u8::from(Command::KeyTransfer)];
            frame_bytes.extend_from_slice(&wrapped);
            let session = self.session.as_mut().expect("session checked above");
            session.key_transfer_frame = Some(frame_bytes);
            info!(%addr, "device pushed a challenge, transferring wrapped key");
            self.set_state(registry, PairingState::ChallengeReceived, now);
            let frame = Frame::targeted(self.controller, addr, Command::KeyTransfer, &wrapped);
            self.queue(PendingOp::KeyTransfer, TxRequest::short(frame), now);
        } else {
            let session = self.session.as_ref().expect("session checked above");
            let transfer_frame = session
                .key_transfer_frame
                .clone()
                .expect("key transfer frame recorded");
            let block = crypto::session_key_2w(&challenge, &system_key, &transfer_frame);
            registry.store_session_key(addr, &block, now);
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&block[..6]);
            debug!(%addr, mac = %hex::encode(mac), "answering key-transfer challenge");
            let frame = Frame::targeted(self.controller, addr, Command::ChallengeAnswer, &mac);
            self.queue(PendingOp::ChallengeAnswer, TxRequest::short(frame), now);
        }
    }

    fn handle_error_status(&mut self, status: u8, registry: &mut DeviceRegistry, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let addr = session.addr;
        match status {
            STATUS_NOT_READY => {
                session.not_ready_count += 1;
                warn!(
                    %addr,
                    count = session.not_ready_count,
                    "peer not in pairing mode, press its pairing button"
                );
                if session.not_ready_count >= PEER_NOT_READY_LIMIT {
                    warn!(%addr, "too many not-ready replies, aborting pairing");
                    registry.fail_pairing(addr, now);
                    self.session = None;
                }
            }
            STATUS_KEY_REJECTED => {
                // Retrying with the same key would only be rejected again.
                let err = GatewayError::PeerRejected;
                warn!(%addr, %err, "aborting pairing");
                registry.fail_pairing(addr, now);
                self.last_failure = Some(err);
                self.session = None;
            }
            other => {
                warn!(%addr, status = %format_args!("0x{other:02x}"), "peer status, continuing");
            }
        }
    }

    /// Entering `KeyExchanged` installs the configured system key and starts
    /// the serialized identity harvest after a settle delay.
    fn install_key_and_harvest(&mut self, registry: &mut DeviceRegistry, now: Instant) {
        let Some(addr) = self.current_address() else {
            return;
        };
        if let Some(key) = self.system_key {
            registry.store_system_key(addr, &key, now);
        }
        self.set_state(registry, PairingState::KeyExchanged, now);
        let frame = Frame::targeted(self.controller, addr, Command::NameRequest, &[]);
        self.queue_at(
            PendingOp::NameRequest,
            TxRequest::short(frame),
            now + INFO_REQUEST_DELAY,
        );
    }

    fn set_state(&mut self, registry: &mut DeviceRegistry, state: PairingState, now: Instant) {
        if let Some(session) = self.session.as_mut() {
            session.last_step_at = now;
            session.last_wait_log = None;
            if let Some(device) = registry.get_mut(session.addr) {
                debug!(addr = %session.addr, from = ?device.pairing_state, to = ?state, "pairing state");
                device.pairing_state = state;
            }
        }
    }

    fn queue(&mut self, op: PendingOp, tx: TxRequest, now: Instant) {
        self.queue_at(op, tx, now);
    }

    fn queue_at(&mut self, op: PendingOp, tx: TxRequest, at: Instant) {
        if let Some(session) = self.session.as_mut() {
            session.pending = Some(PendingSend::new(op, tx, at));
        }
    }
}
