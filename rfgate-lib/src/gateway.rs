//! Gateway loop: one task owning the registry, the pairing engine and the
//! response handler, fed by radio inbound frames and a periodic tick.
//!
//! The three collaborators are plain owned values created at startup and
//! passed by explicit handle; nothing here is global. All state transitions
//! and registry mutations happen on this task, so no locking is needed.

use crate::constants::*;
use crate::crypto;
use crate::device::{MacScope, PairingState};
use crate::error::GatewayError;
use crate::message::Message;
use crate::packet::{Address, Command, Frame};
use crate::pairing::PairingEngine;
use crate::radio::{RadioTransport, TxRequest};
use crate::registry::DeviceRegistry;
use crate::response::ResponseHandler;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub controller_address: Address,
    /// Family-wide key-wrap constant; overridable for bench setups.
    pub transfer_key: [u8; 16],
    /// Long-lived secret installed into devices during pairing. Pairing is
    /// refused while unset.
    pub system_key: Option<[u8; 16]>,
    pub auto_pair: bool,
    pub registry_path: PathBuf,
    /// MAC body variant assigned to newly enrolled devices.
    pub default_mac_scope: MacScope,
    pub tick_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            controller_address: Address::CONTROLLER,
            transfer_key: crypto::TRANSFER_KEY,
            system_key: None,
            auto_pair: false,
            registry_path: PathBuf::from("devices.json"),
            default_mac_scope: MacScope::default(),
            tick_interval: Duration::from_millis(250),
        }
    }
}

pub struct Gateway<R: RadioTransport> {
    config: GatewayConfig,
    registry: DeviceRegistry,
    pairing: PairingEngine,
    response: ResponseHandler,
    radio: R,
}

impl<R: RadioTransport> Gateway<R> {
    /// Build the gateway and load the durable registry. A missing registry
    /// file is a fresh start, not an error.
    pub fn new(config: GatewayConfig, radio: R) -> Result<Self, GatewayError> {
        let mut registry = DeviceRegistry::new(&config.registry_path);
        registry.load_durable()?;

        let mut pairing = PairingEngine::new(config.controller_address, config.transfer_key);
        if let Some(key) = config.system_key {
            pairing.set_system_key(key);
        }
        pairing.set_auto_pair(config.auto_pair);

        Ok(Gateway {
            response: ResponseHandler::new(config.controller_address),
            registry,
            pairing,
            radio,
            config,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    pub fn pairing(&self) -> &PairingEngine {
        &self.pairing
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn start_pairing(&mut self, addr: Address, now: Instant) -> Result<(), GatewayError> {
        self.pairing.start(addr, &mut self.registry, now)?;
        if let Some(device) = self.registry.get_mut(addr) {
            device.mac_scope = self.config.default_mac_scope;
        }
        Ok(())
    }

    pub fn enable_auto_pair(&mut self) -> Result<(), GatewayError> {
        if self.config.system_key.is_none() {
            return Err(GatewayError::SystemKeyMissing);
        }
        self.pairing.set_auto_pair(true);
        Ok(())
    }

    pub fn cancel_pairing(&mut self) {
        self.pairing.cancel(&mut self.registry);
    }

    /// Switch a paired actuator on or off (application command `0x00`).
    pub fn switch(&mut self, addr: Address, on: bool, now: Instant) -> Result<(), GatewayError> {
        let payload = if on {
            ACTIVATE_ON_PAYLOAD
        } else {
            ACTIVATE_OFF_PAYLOAD
        };
        self.send_application_command(addr, Command::Activate, &payload, now)
    }

    /// Query device status (application command `0x03`).
    pub fn status_query(&mut self, addr: Address, now: Instant) -> Result<(), GatewayError> {
        self.send_application_command(addr, Command::StatusQuery, &STATUS_QUERY_PAYLOAD, now)
    }

    /// Operator test hook: arbitrary command byte and payload at a paired
    /// device, recorded like any other command so the challenge path can
    /// authenticate it.
    pub fn raw_command(
        &mut self,
        addr: Address,
        command: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), GatewayError> {
        let command = Command::try_from(command).map_err(|_| GatewayError::UnknownCommand(command))?;
        self.send_application_command(addr, command, payload, now)
    }

    /// Legacy learning-mode nudge for peers that drive the old flow.
    pub fn send_learning_mode(&mut self, addr: Address) -> Result<(), GatewayError> {
        let frame = Frame::targeted(
            self.config.controller_address,
            addr,
            Command::LearningMode,
            &LEARNING_MODE_PAYLOAD,
        );
        self.submit(TxRequest::short(frame))
    }

    fn send_application_command(
        &mut self,
        addr: Address,
        command: Command,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), GatewayError> {
        let device = self
            .registry
            .get_mut(addr)
            .ok_or(GatewayError::DeviceNotFound(addr))?;
        if device.pairing_state != PairingState::Paired {
            return Err(GatewayError::NotPaired(addr));
        }
        device.store_command(command, payload);
        let seq = device.next_sequence();
        let frame = Frame::targeted(self.config.controller_address, addr, command, payload);
        self.submit(TxRequest::short(frame))?;
        debug!(%addr, ?command, seq, payload = %hex::encode(payload), "application command sent");
        Ok(())
    }

    fn submit(&mut self, tx: TxRequest) -> Result<(), GatewayError> {
        if self.radio.state().is_busy() {
            return Err(GatewayError::RadioBusy(self.radio.state()));
        }
        self.radio.submit(tx)
    }

    /// One cooperative tick: drive the pairing machine, then sweep sessions
    /// past the umbrella timeout.
    pub fn tick(&mut self, now: Instant) {
        self.pairing.process(&mut self.registry, &mut self.radio, now);
        for addr in self.registry.sweep_timed_out(now) {
            warn!(%addr, "stale pairing swept to failed");
        }
    }

    /// Route one decoded, CRC-valid inbound frame.
    pub fn dispatch(&mut self, frame: &Frame, now: Instant) {
        if frame.target != self.config.controller_address && !frame.is_broadcast() {
            debug!(source = %frame.source, target = %frame.target, "frame for someone else");
            return;
        }
        if self
            .pairing
            .handle_frame(frame, &mut self.registry, &mut self.radio, now)
        {
            return;
        }
        if self
            .pairing
            .maybe_auto_adopt(frame, &mut self.registry, &mut self.radio, now)
        {
            return;
        }
        if self
            .response
            .handle_frame(frame, &mut self.registry, &mut self.radio, now)
        {
            return;
        }
        self.handle_secondary(frame, now);
    }

    /// Device-initiated flows outside a pairing session.
    fn handle_secondary(&mut self, frame: &Frame, now: Instant) {
        match Message::try_from(frame) {
            Ok(Message::ForceKeyExchange { challenge }) => {
                self.handle_key_pull(frame.source, challenge, now);
            }
            Ok(message) => {
                if let Some(device) = self.registry.get_mut(frame.source) {
                    device.touch(now);
                }
                debug!(source = %frame.source, ?message, "unhandled frame");
            }
            Err(err) => {
                warn!(source = %frame.source, %err, "dropping malformed frame");
            }
        }
    }

    /// Pull-variant key transfer: a device asks for the system key with a
    /// `0x38` carrying its challenge; the answer is a `0x32` wrapping the
    /// key against `{0x38 ‖ challenge}`.
    fn handle_key_pull(&mut self, source: Address, challenge: [u8; 6], now: Instant) {
        let key = self
            .registry
            .get(source)
            .and_then(|d| d.system_key)
            .or(self.config.system_key);
        let Some(key) = key else {
            warn!(%source, "key pull request but no key available, dropping");
            return;
        };
        let mut wrap_frame = vec![u8::from(Command::ForceKeyExchange)];
        wrap_frame.extend_from_slice(&challenge);
        let wrapped = crypto::wrap_key(&key, &challenge, &wrap_frame, &self.config.transfer_key);
        let frame = Frame::targeted(
            self.config.controller_address,
            source,
            Command::KeyTransfer,
            &wrapped,
        );
        match self.submit(TxRequest::short(frame)) {
            Ok(()) => {
                info!(%source, "answered key pull with wrapped system key");
                self.registry.store_challenge(source, &challenge, now);
                // Both sides hold the wrap keystream after the exchange.
                let pad = crypto::transfer_pad(&challenge, &wrap_frame, &self.config.transfer_key);
                self.registry.store_stack_key(source, &pad, now);
            }
            Err(err) => warn!(%source, %err, "could not answer key pull"),
        }
    }

    /// Drive the gateway until `done` reports completion or the inbound
    /// channel closes. Ticks and inbound frames are serialized here; frames
    /// submitted within one tick reach the radio in submission order.
    pub async fn run_until(
        &mut self,
        inbound: &mut mpsc::Receiver<Frame>,
        mut done: impl FnMut(&Gateway<R>) -> bool,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
                maybe_frame = inbound.recv() => match maybe_frame {
                    Some(frame) => self.dispatch(&frame, Instant::now()),
                    None => {
                        info!("inbound channel closed, stopping gateway loop");
                        break;
                    }
                },
            }
            if done(self) {
                break;
            }
        }
    }
}
