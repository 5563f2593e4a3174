use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Result;
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;

type HmacSha256 = hmac::Hmac<Sha256>;

/// Seals host credentials at rest. Only the sealed form ever reaches the
/// store; plaintext lives just long enough to hand it to the ssh process.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

/// Derive a 256-bit key with HMAC-SHA256. An explicit secret from the config
/// wins; otherwise hostname + username keep the key stable across restarts
/// but tied to the local machine/user.
fn derive_key(secret: Option<&str>) -> Result<[u8; 32]> {
    let input = match secret {
        Some(s) => s.to_string(),
        None => {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-host".to_string());
            format!("{}{}", hostname, whoami::username())
        }
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"vpsorch-credentials-v1")
        .map_err(|e| anyhow::anyhow!("HMAC init failed: {}", e))?;
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl CredentialVault {
    pub fn new(secret: Option<&str>) -> Result<Self> {
        let key = derive_key(secret)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow::anyhow!("Invalid vault key: {}", e))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a base64(nonce || ciphertext) value. Returns plaintext.
    pub fn open(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("Base64 decode failed: {}", e))?;

        if combined.len() < 13 {
            return Err(anyhow::anyhow!("Sealed value too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("UTF-8 decode failed: {}", e))
    }
}
