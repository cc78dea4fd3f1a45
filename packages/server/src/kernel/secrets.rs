//! Optional at-rest encryption for BMC credentials.
//!
//! With a passphrase configured, secrets are age-encrypted (scrypt recipient)
//! and stored base64-armored behind a scheme prefix. Rows written before
//! encryption was enabled stay readable: anything without the prefix is
//! returned as-is.

use age::secrecy::SecretString;
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const SEALED_PREFIX: &str = "enc:";

pub enum SecretCipher {
    Plaintext,
    Passphrase {
        recipient: age::scrypt::Recipient,
        identity: age::scrypt::Identity,
    },
}

impl SecretCipher {
    pub fn plaintext() -> Self {
        SecretCipher::Plaintext
    }

    pub fn from_passphrase(passphrase: Option<&str>) -> Self {
        match passphrase {
            None => SecretCipher::Plaintext,
            Some(p) => SecretCipher::Passphrase {
                recipient: age::scrypt::Recipient::new(SecretString::from(p.to_string())),
                identity: age::scrypt::Identity::new(SecretString::from(p.to_string())),
            },
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        match self {
            SecretCipher::Plaintext => Ok(plaintext.to_string()),
            SecretCipher::Passphrase { recipient, .. } => {
                let sealed = age::encrypt(recipient, plaintext.as_bytes())
                    .map_err(|e| anyhow!("encrypting secret: {e}"))?;
                Ok(format!("{SEALED_PREFIX}{}", BASE64.encode(sealed)))
            }
        }
    }

    pub fn open(&self, stored: &str) -> Result<String> {
        let Some(armored) = stored.strip_prefix(SEALED_PREFIX) else {
            return Ok(stored.to_string());
        };

        match self {
            SecretCipher::Plaintext => Err(anyhow!(
                "stored secret is encrypted but no passphrase is configured"
            )),
            SecretCipher::Passphrase { identity, .. } => {
                let sealed = BASE64.decode(armored).context("decoding sealed secret")?;
                let plain = age::decrypt(identity, &sealed)
                    .map_err(|e| anyhow!("decrypting secret: {e}"))?;
                String::from_utf8(plain).context("sealed secret is not UTF-8")
            }
        }
    }
}
