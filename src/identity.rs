//! Agent identity: the 128-bit mesh identifier plus the persisted
//! management keypair advertised in node info.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::IdentityError;

/// Opaque 128-bit agent identifier. All ordering and loop-detection
/// comparisons are byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId([u8; 16]);

impl AgentId {
    pub const LEN: usize = 16;

    /// Generates a fresh random id.
    pub fn random() -> Self {
        AgentId(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        AgentId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the 32-hex-char form; case-insensitive.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentityError::BadId(s.to_string()));
        }
        let mut out = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (chunk[1] as char).to_digit(16).unwrap_or(0) as u8;
            out[i] = (hi << 4) | lo;
        }
        Ok(AgentId(out))
    }

    /// Eight-hex-char short form used in logs.
    pub fn short(&self) -> String {
        let mut s = String::with_capacity(8);
        for b in &self.0[..4] {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.short())
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AgentId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The agent's durable identity: mesh id, display name, and the Ed25519
/// keypair whose public half is advertised for management-plane use.
pub struct AgentIdentity {
    pub id: AgentId,
    pub display_name: String,
    signing: SigningKey,
}

const ID_FILE: &str = "agent.id";
const KEY_FILE: &str = "management.key";

impl AgentIdentity {
    /// Creates an ephemeral identity that is not persisted anywhere.
    pub fn ephemeral(display_name: impl Into<String>) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            id: AgentId::random(),
            display_name: display_name.into(),
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Loads the identity from `data_dir`, generating and persisting a new
    /// one on first start. A configured id of `"auto"` (or absence) means
    /// generate-and-persist; an explicit hex id overrides the stored one.
    pub fn load_or_create(
        data_dir: &Path,
        configured_id: Option<&str>,
        display_name: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        std::fs::create_dir_all(data_dir)?;

        let id_path = data_dir.join(ID_FILE);
        let id = match configured_id {
            Some(hex) if hex != "auto" => AgentId::from_hex(hex)?,
            _ => {
                if id_path.exists() {
                    AgentId::from_hex(&std::fs::read_to_string(&id_path)?)?
                } else {
                    let id = AgentId::random();
                    write_private(&id_path, format!("{id}\n").as_bytes())?;
                    id
                }
            }
        };

        let key_path = data_dir.join(KEY_FILE);
        let signing = if key_path.exists() {
            let raw = std::fs::read(&key_path)?;
            let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| IdentityError::BadKey {
                path: key_path.display().to_string(),
            })?;
            SigningKey::from_bytes(&seed)
        } else {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            write_private(&key_path, &seed)?;
            SigningKey::from_bytes(&seed)
        };

        Ok(Self {
            id,
            display_name: display_name.into(),
            signing,
        })
    }

    pub fn management_public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        use ed25519_dalek::Signer;
        self.signing.sign(message)
    }
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
