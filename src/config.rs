//! Client configuration.

use std::time::Duration;

use ethers::types::Address;

pub const DEFAULT_KEY_GENERATION_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_AWAITING_KEY_GENERATION_LOOKBACK: Duration =
    Duration::from_secs(24 * 60 * 60);

/// Grace period for signing events that race a still-persisting key
/// generation.
pub const DEFAULT_AWAITING_SIGNATURE_EVENT_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Confirmations to wait before acting on an observed event. Sized to
/// tolerate plausible single-chain reorgs on the target network.
pub const DEFAULT_BLOCK_CONFIRMATIONS: u64 = 12;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("block confirmations must be greater than zero")]
    ZeroConfirmations,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for a single key generation attempt.
    pub key_generation_timeout: Duration,

    /// Deadline for a single signing attempt; bounds the whole
    /// deduplicate-confirm-sign sequence including its retries.
    pub signing_timeout: Duration,

    /// How far back the startup sweep looks for keeps still awaiting key
    /// generation. Keeps opened earlier than this are skipped.
    pub awaiting_key_generation_lookback: Duration,

    pub awaiting_signature_event_check_timeout: Duration,

    pub block_confirmations: u64,

    /// Applications the operator registers as member candidate for at
    /// startup.
    pub sanctioned_applications: Vec<Address>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            key_generation_timeout: DEFAULT_KEY_GENERATION_TIMEOUT,
            signing_timeout: DEFAULT_SIGNING_TIMEOUT,
            awaiting_key_generation_lookback: DEFAULT_AWAITING_KEY_GENERATION_LOOKBACK,
            awaiting_signature_event_check_timeout:
                DEFAULT_AWAITING_SIGNATURE_EVENT_CHECK_TIMEOUT,
            block_confirmations: DEFAULT_BLOCK_CONFIRMATIONS,
            sanctioned_applications: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_generation_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("key generation timeout"));
        }
        if self.signing_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("signing timeout"));
        }
        if self.awaiting_key_generation_lookback.is_zero() {
            return Err(ConfigError::ZeroDuration("awaiting key generation lookback"));
        }
        if self.awaiting_signature_event_check_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration(
                "awaiting signature event check timeout",
            ));
        }
        if self.block_confirmations == 0 {
            return Err(ConfigError::ZeroConfirmations);
        }
        Ok(())
    }
}
