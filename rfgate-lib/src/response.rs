//! Authenticated-control response path.
//!
//! After pairing, every application command we send is answered by the
//! device with a `0x3C` challenge. Proving we hold its system key means
//! sending back `0x3D` with a six-byte MAC; only then does the device
//! execute the command and confirm with `0x04`.

use crate::crypto;
use crate::device::{MacScope, PairingState};
use crate::error::GatewayError;
use crate::message::Message;
use crate::packet::{Address, Command, Frame};
use crate::radio::{RadioTransport, TxRequest};
use crate::registry::DeviceRegistry;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct ResponseHandler {
    controller: Address,
}

impl ResponseHandler {
    pub fn new(controller: Address) -> Self {
        ResponseHandler { controller }
    }

    /// Feed a post-pairing frame. Returns true when consumed.
    pub fn handle_frame(
        &self,
        frame: &Frame,
        registry: &mut DeviceRegistry,
        radio: &mut dyn RadioTransport,
        now: Instant,
    ) -> bool {
        match frame.command {
            Command::Challenge => self.handle_challenge(frame, registry, radio, now),
            Command::StatusReply => self.handle_confirmation(frame, registry, now),
            _ => false,
        }
    }

    fn handle_challenge(
        &self,
        frame: &Frame,
        registry: &mut DeviceRegistry,
        radio: &mut dyn RadioTransport,
        now: Instant,
    ) -> bool {
        let source = frame.source;
        let Ok(Message::Challenge { challenge }) = Message::try_from(frame) else {
            warn!(%source, "dropping short challenge frame");
            return true;
        };

        // All preconditions checked before any state is touched: a challenge
        // we cannot answer must not arm the pending flag.
        let (system_key, body) = match registry.get(source) {
            None => {
                warn!(%source, "challenge from unknown device, dropping");
                return true;
            }
            Some(device) => {
                if !device.pairing_state.is_terminal() {
                    // Mid-pairing challenges belong to the pairing engine.
                    return false;
                }
                if device.pairing_state != PairingState::Paired {
                    warn!(%source, state = ?device.pairing_state, "challenge from unpaired device, dropping");
                    return true;
                }
                let Some(key) = device.system_key else {
                    warn!(%source, "paired device has no system key, dropping challenge");
                    return true;
                };
                let Some(stored) = &device.last_command else {
                    warn!(%source, "challenge with no command on record, dropping");
                    return true;
                };
                let body = match device.mac_scope {
                    MacScope::ResponseByte => vec![u8::from(Command::ChallengeAnswer)],
                    MacScope::FullCommand => stored.frame_bytes(),
                };
                (key, body)
            }
        };

        registry.store_challenge(source, &challenge, now);
        let mac = crypto::mac_2w(&challenge, &system_key, &body);
        let answer = Frame::targeted(self.controller, source, Command::ChallengeAnswer, &mac);
        match self.send(radio, answer) {
            Ok(()) => {
                debug!(%source, mac = %hex::encode(mac), "challenge answered");
                registry.store_response(source, &mac, now);
            }
            Err(err) => {
                // Challenge stays pending; the device re-challenges or the
                // caller retries the command.
                warn!(%source, %err, "could not answer challenge");
            }
        }
        true
    }

    fn handle_confirmation(
        &self,
        frame: &Frame,
        registry: &mut DeviceRegistry,
        now: Instant,
    ) -> bool {
        let source = frame.source;
        match registry.get_mut(source) {
            Some(device) if device.pairing_state == PairingState::Paired => {
                device.touch(now);
                info!(%source, payload = %hex::encode(&frame.payload), "command confirmed");
                true
            }
            _ => false,
        }
    }

    fn send(&self, radio: &mut dyn RadioTransport, frame: Frame) -> Result<(), GatewayError> {
        if radio.state().is_busy() {
            return Err(GatewayError::RadioBusy(radio.state()));
        }
        radio.submit(TxRequest::short(frame))
    }
}
