use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::credentials::{CredentialStore, KeyStream};
use crate::crypto::AdbPrivateKey;
use crate::protocol::constants::{AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN};
use crate::protocol::{AdbError, AdbMessage, AdbResult, Command};

/// AUTH packet sub-type, carried in arg0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    Token = AUTH_TOKEN,
    Signature = AUTH_SIGNATURE,
    RsaPublicKey = AUTH_RSAPUBLICKEY,
}

impl TryFrom<u32> for AuthType {
    type Error = AdbError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            AUTH_TOKEN => Ok(AuthType::Token),
            AUTH_SIGNATURE => Ok(AuthType::Signature),
            AUTH_RSAPUBLICKEY => Ok(AuthType::RsaPublicKey),
            other => Err(AdbError::UnsupportedPacket(other)),
        }
    }
}

/// Identifies a key in authentication events without exposing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub name: Option<String>,
}

impl From<&AdbPrivateKey> for KeyInfo {
    fn from(key: &AdbPrivateKey) -> Self {
        Self {
            fingerprint: key.fingerprint(),
            name: key.name().map(str::to_string),
        }
    }
}

/// Progress notifications from the authentication processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A token was signed with this key.
    SignatureAttempted(KeyInfo),
    /// The device sent a new token after this key signed, so it was not accepted.
    SignatureRejected(KeyInfo),
    /// The public key was offered; the device will prompt the user.
    PublicKeyEnrollment(KeyInfo),
    /// The store failed to load a key; it was skipped.
    KeyLoadFailed(String),
}

/// Answers the device's AUTH tokens.
///
/// Stored keys are tried in order, one per token. Once they are exhausted the
/// first key (or a freshly generated one) is offered as a public key.
pub struct AuthProcessor {
    store: Arc<dyn CredentialStore>,
    keys: Option<KeyStream>,
    exhausted: bool,
    first_key: Option<AdbPrivateKey>,
    previous_key: Option<KeyInfo>,
    enrolled: bool,
    events: Option<mpsc::UnboundedSender<AuthEvent>>,
}

impl AuthProcessor {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            keys: None,
            exhausted: false,
            first_key: None,
            previous_key: None,
            enrolled: false,
            events: None,
        }
    }

    /// Deliver [`AuthEvent`]s to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<AuthEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: AuthEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Produce the response to one AUTH packet from the device.
    pub async fn process(&mut self, message: &AdbMessage) -> AdbResult<AdbMessage> {
        if message.command != Command::AUTH {
            return Err(AdbError::UnexpectedPacket {
                command: message.command.name(),
                reason: "authentication processor only handles AUTH".into(),
            });
        }
        if AuthType::try_from(message.arg0)? != AuthType::Token {
            return Err(AdbError::UnsupportedPacket(message.arg0));
        }

        if self.enrolled {
            return Err(AdbError::AuthRejected(
                "device did not accept the offered public key".into(),
            ));
        }

        if let Some(key) = self.next_key().await {
            let info = KeyInfo::from(&key);
            if let Some(previous) = self.previous_key.replace(info.clone()) {
                tracing::debug!(fingerprint = %previous.fingerprint, "Signature rejected");
                self.emit(AuthEvent::SignatureRejected(previous));
            }
            tracing::debug!(fingerprint = %info.fingerprint, "Signing AUTH token");
            self.emit(AuthEvent::SignatureAttempted(info));

            let signature = key.sign(&message.payload)?;
            if self.first_key.is_none() {
                self.first_key = Some(key);
            }
            return Ok(AdbMessage::auth(AuthType::Signature as u32, signature.to_vec()));
        }

        if let Some(previous) = self.previous_key.take() {
            tracing::debug!(fingerprint = %previous.fingerprint, "Signature rejected");
            self.emit(AuthEvent::SignatureRejected(previous));
        }

        let key = match self.first_key.clone() {
            Some(key) => key,
            None => self
                .store
                .generate_key()
                .await
                .map_err(AdbError::CredentialStore)?,
        };
        let info = KeyInfo::from(&key);
        tracing::info!(fingerprint = %info.fingerprint, "Offering public key, confirm on device");
        self.emit(AuthEvent::PublicKeyEnrollment(info));
        self.enrolled = true;

        Ok(AdbMessage::auth(
            AuthType::RsaPublicKey as u32,
            key.public_key_payload(),
        ))
    }

    /// Pull the next loadable key, reporting and skipping load failures.
    async fn next_key(&mut self) -> Option<AdbPrivateKey> {
        if self.exhausted {
            return None;
        }
        let store = &self.store;
        let keys = self.keys.get_or_insert_with(|| store.iterate_keys());
        loop {
            match keys.next().await {
                Some(Ok(key)) => return Some(key),
                Some(Err(e)) => {
                    tracing::warn!("Failed to load ADB key: {:#}", e);
                    if let Some(events) = &self.events {
                        let _ = events.send(AuthEvent::KeyLoadFailed(format!("{:#}", e)));
                    }
                }
                None => {
                    self.exhausted = true;
                    self.keys = None;
                    return None;
                }
            }
        }
    }

    /// Release the key stream.
    pub fn close(&mut self) {
        self.keys = None;
        self.exhausted = true;
    }
}
