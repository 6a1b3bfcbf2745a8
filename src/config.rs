//! Endpoint configuration.

use std::net::SocketAddrV4;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{Crypt, Key, KEY_SIZE};
use crate::tunnel::MAX_MTU;

/// Client-side configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfigFile {
    /// Server endpoint, `ip:port`
    pub server_addr: SocketAddrV4,
    /// Local port the fake flow originates from
    pub src_port: u16,
    /// MTU to fragment against
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Pre-shared key, base64 (32 bytes); plaintext tunnel when absent
    #[serde(default)]
    pub key_b64: Option<String>,
    /// Passphrase to derive the key from; ignored when `key_b64` is set
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Re-handshake period in seconds; no reconnects when absent
    #[serde(default)]
    pub reconnect_secs: Option<u64>,
}

/// Server-side configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Port clients connect to
    pub listen_port: u16,
    /// MTU to fragment against
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Pre-shared key, base64 (32 bytes); plaintext tunnel when absent
    #[serde(default)]
    pub key_b64: Option<String>,
    /// Passphrase to derive the key from; ignored when `key_b64` is set
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_mtu() -> usize {
    MAX_MTU
}

fn build_crypt(key_b64: &Option<String>, passphrase: &Option<String>) -> Result<Crypt, String> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    if let Some(encoded) = key_b64 {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| format!("invalid base64 key: {}", e))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| format!("key must be {} bytes", KEY_SIZE))?;
        return Ok(Crypt::chacha20_poly1305(&Key::from_bytes(bytes)));
    }
    if let Some(phrase) = passphrase {
        return Ok(Crypt::chacha20_poly1305(&Key::from_passphrase(phrase)));
    }
    Ok(Crypt::plain())
}

fn validate_mtu(mtu: usize) -> Result<(), String> {
    // Room for the IPv4 header and one aligned fragment body
    if mtu < 48 {
        return Err(format!("mtu {} too small", mtu));
    }
    if mtu > MAX_MTU {
        return Err(format!("mtu {} exceeds {}", mtu, MAX_MTU));
    }
    Ok(())
}

impl ClientConfigFile {
    /// Validate field ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.src_port == 0 {
            return Err("src_port cannot be 0".into());
        }
        validate_mtu(self.mtu)
    }

    /// Build the cipher handle this configuration names.
    pub fn crypt(&self) -> Result<Crypt, String> {
        build_crypt(&self.key_b64, &self.passphrase)
    }

    /// The reconnect period, if any.
    pub fn reconnect(&self) -> Option<Duration> {
        self.reconnect_secs.map(Duration::from_secs)
    }
}

impl ServerConfigFile {
    /// Validate field ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_port == 0 {
            return Err("listen_port cannot be 0".into());
        }
        validate_mtu(self.mtu)
    }

    /// Build the cipher handle this configuration names.
    pub fn crypt(&self) -> Result<Crypt, String> {
        build_crypt(&self.key_b64, &self.passphrase)
    }
}
