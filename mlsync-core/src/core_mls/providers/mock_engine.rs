//! Mock Crypto Engine
//!
//! Deterministic group engine for tests. Messages are sealed with real
//! ChaCha20Poly1305 under a per-epoch key, so tampering and wrong-epoch
//! decryption fail the way a real engine would. Epoch secrets evolve with
//! HKDF from the previous secret and the commit contents, which keeps every
//! member that applies the same commits in sync.
//!
//! Encodings (magic prefix followed by the body):
//!
//! ```text
//! ciphertext   MCT1 || epoch (u64 BE) || nonce (12) || aead
//! commit       MCM1 || json
//! welcome      MWL1 || json
//! key package  MKP1 || json
//! ```

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::traits::{CryptoEngine, DecryptedMessage, KeyPackageBundle, StagedCommit};
use crate::core_mls::types::GroupConfig;

const CIPHERTEXT_MAGIC: &[u8; 4] = b"MCT1";
const COMMIT_MAGIC: &[u8; 4] = b"MCM1";
const WELCOME_MAGIC: &[u8; 4] = b"MWL1";
const KEY_PACKAGE_MAGIC: &[u8; 4] = b"MKP1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 8 + NONCE_LEN;

#[derive(Clone, Serialize, Deserialize)]
struct GroupRecord {
    group_id: Vec<u8>,
    epoch: u64,
    /// Secrets by epoch; the newest is current
    secrets: BTreeMap<u64, Vec<u8>>,
    members: Vec<Vec<u8>>,
    own_identity: Vec<u8>,
    max_past_epochs: u64,
    #[serde(skip)]
    pending: Option<PendingCommit>,
}

#[derive(Clone)]
struct PendingCommit {
    new_epoch: u64,
    added: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct CommitBody {
    group_id: String,
    epoch: u64,
    added: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct WelcomeBody {
    group_id: String,
    epoch: u64,
    secret: String,
    members: Vec<String>,
    max_past_epochs: u64,
}

#[derive(Serialize, Deserialize)]
struct KeyPackageBody {
    identity: String,
    init_key: String,
}

#[derive(Default)]
struct EngineState {
    initialized: bool,
    groups: HashMap<Vec<u8>, GroupRecord>,
}

/// Deterministic [`CryptoEngine`] backed by in-memory groups
pub struct MockCryptoEngine {
    state: Mutex<EngineState>,
}

impl MockCryptoEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                initialized: true,
                groups: HashMap::new(),
            }),
        }
    }

    /// Engine that rejects every call until [`MockCryptoEngine::initialize`]
    pub fn uninitialized() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn initialize(&self) {
        self.lock().initialized = true;
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ready(&self) -> MlsResult<MutexGuard<'_, EngineState>> {
        let state = self.lock();
        if !state.initialized {
            return Err(MlsError::ContextNotInitialized);
        }
        Ok(state)
    }
}

impl Default for MockCryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRecord {
    fn current_secret(&self) -> MlsResult<&[u8]> {
        self.secrets
            .get(&self.epoch)
            .map(Vec::as_slice)
            .ok_or_else(|| MlsError::Crypto(format!("no secret for epoch {}", self.epoch)))
    }

    /// Move to `new_epoch`, deriving its secret from the current one
    fn advance(&mut self, new_epoch: u64, added: &[Vec<u8>]) -> MlsResult<()> {
        let next = next_epoch_secret(self.current_secret()?, &self.group_id, new_epoch, added)?;
        self.secrets.insert(new_epoch, next);
        self.epoch = new_epoch;
        for identity in added {
            if !self.members.contains(identity) {
                self.members.push(identity.clone());
            }
        }
        let min_epoch = self.epoch.saturating_sub(self.max_past_epochs);
        self.secrets.retain(|epoch, _| *epoch >= min_epoch);
        Ok(())
    }
}

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> MlsResult<Vec<u8>> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; len];
    hkdf.expand(info, &mut out)
        .map_err(|e| MlsError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(out)
}

fn next_epoch_secret(
    current: &[u8],
    group_id: &[u8],
    new_epoch: u64,
    added: &[Vec<u8>],
) -> MlsResult<Vec<u8>> {
    let mut hasher = Sha256::new();
    for identity in added {
        hasher.update(identity);
    }
    let mut info = b"mock-epoch-advance".to_vec();
    info.extend_from_slice(&new_epoch.to_be_bytes());
    info.extend_from_slice(&hasher.finalize());
    hkdf_expand(group_id, current, &info, 32)
}

fn message_cipher(secret: &[u8], group_id: &[u8]) -> MlsResult<ChaCha20Poly1305> {
    let key = Zeroizing::new(hkdf_expand(group_id, secret, b"mock-message-key", 32)?);
    Ok(ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(
        &key,
    )))
}

fn encode<T: Serialize>(magic: &[u8; 4], body: &T) -> MlsResult<Vec<u8>> {
    let mut out = magic.to_vec();
    out.extend_from_slice(&serde_json::to_vec(body)?);
    Ok(out)
}

fn decode<T: for<'de> Deserialize<'de>>(magic: &[u8; 4], bytes: &[u8]) -> Result<T, String> {
    let body = bytes
        .strip_prefix(magic.as_slice())
        .ok_or_else(|| "unexpected magic".to_string())?;
    serde_json::from_slice(body).map_err(|e| e.to_string())
}

fn hex_decode(field: &str, value: &str) -> Result<Vec<u8>, String> {
    hex::decode(value).map_err(|e| format!("{}: {}", field, e))
}

#[async_trait]
impl CryptoEngine for MockCryptoEngine {
    async fn create_group(
        &self,
        identity: &[u8],
        group_id: Option<&[u8]>,
        config: &GroupConfig,
    ) -> MlsResult<Vec<u8>> {
        if identity.is_empty() {
            return Err(MlsError::InvalidIdentity("empty identity".to_string()));
        }
        let mut state = self.ready()?;

        let group_id = match group_id {
            Some(id) => id.to_vec(),
            None => {
                let mut id = vec![0u8; 16];
                rand::rng().fill(id.as_mut_slice());
                id
            }
        };
        if state.groups.contains_key(&group_id) {
            return Err(MlsError::InvalidGroupId(format!(
                "group {} already exists",
                hex::encode(&group_id)
            )));
        }

        let mut secret = vec![0u8; 32];
        rand::rng().fill(secret.as_mut_slice());

        state.groups.insert(
            group_id.clone(),
            GroupRecord {
                group_id: group_id.clone(),
                epoch: 0,
                secrets: BTreeMap::from([(0, secret)]),
                members: vec![identity.to_vec()],
                own_identity: identity.to_vec(),
                max_past_epochs: config.max_past_epochs,
                pending: None,
            },
        );
        Ok(group_id)
    }

    async fn create_key_package(&self, identity: &[u8]) -> MlsResult<KeyPackageBundle> {
        let _state = self.ready()?;
        if identity.is_empty() {
            return Err(MlsError::InvalidIdentity("empty identity".to_string()));
        }

        let mut init_key = Zeroizing::new(vec![0u8; 32]);
        rand::rng().fill(init_key.as_mut_slice());
        let init_public = Sha256::digest(init_key.as_slice());

        let key_package = encode(
            KEY_PACKAGE_MAGIC,
            &KeyPackageBody {
                identity: hex::encode(identity),
                init_key: hex::encode(init_public),
            },
        )?;
        let hash_ref = Sha256::digest(&key_package).to_vec();

        Ok(KeyPackageBundle {
            key_package,
            hash_ref,
            hpke_private_key: init_key,
        })
    }

    async fn add_members(
        &self,
        group_id: &[u8],
        key_packages: &[Vec<u8>],
    ) -> MlsResult<StagedCommit> {
        let mut state = self.ready()?;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))?;

        let mut added = Vec::with_capacity(key_packages.len());
        for kp in key_packages {
            let body: KeyPackageBody =
                decode(KEY_PACKAGE_MAGIC, kp).map_err(MlsError::InvalidMessage)?;
            added.push(hex_decode("identity", &body.identity).map_err(MlsError::InvalidMessage)?);
        }

        let new_epoch = group.epoch + 1;
        let next_secret = next_epoch_secret(group.current_secret()?, group_id, new_epoch, &added)?;

        let commit = encode(
            COMMIT_MAGIC,
            &CommitBody {
                group_id: hex::encode(group_id),
                epoch: new_epoch,
                added: added.iter().map(hex::encode).collect(),
            },
        )?;

        let mut members: Vec<String> = group.members.iter().map(hex::encode).collect();
        members.extend(added.iter().map(hex::encode));
        let welcome = encode(
            WELCOME_MAGIC,
            &WelcomeBody {
                group_id: hex::encode(group_id),
                epoch: new_epoch,
                secret: hex::encode(&next_secret),
                members,
                max_past_epochs: group.max_past_epochs,
            },
        )?;

        group.pending = Some(PendingCommit { new_epoch, added });

        Ok(StagedCommit {
            commit,
            welcome: Some(welcome),
            new_epoch,
        })
    }

    async fn merge_pending_commit(&self, group_id: &[u8]) -> MlsResult<u64> {
        let mut state = self.ready()?;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))?;
        let pending = group
            .pending
            .take()
            .ok_or_else(|| MlsError::InvalidMessage("no pending commit".to_string()))?;

        group.advance(pending.new_epoch, &pending.added)?;
        Ok(group.epoch)
    }

    async fn clear_pending_commit(&self, group_id: &[u8]) -> MlsResult<()> {
        let mut state = self.ready()?;
        if let Some(group) = state.groups.get_mut(group_id) {
            group.pending = None;
        }
        Ok(())
    }

    async fn process_welcome(
        &self,
        welcome: &[u8],
        identity: &[u8],
        config: &GroupConfig,
    ) -> MlsResult<Vec<u8>> {
        let mut state = self.ready()?;
        let body: WelcomeBody =
            decode(WELCOME_MAGIC, welcome).map_err(MlsError::InvalidWelcomeMessage)?;

        let group_id =
            hex_decode("group_id", &body.group_id).map_err(MlsError::InvalidWelcomeMessage)?;
        let secret = hex_decode("secret", &body.secret).map_err(MlsError::InvalidWelcomeMessage)?;
        let members = body
            .members
            .iter()
            .map(|m| hex_decode("member", m))
            .collect::<Result<Vec<_>, _>>()
            .map_err(MlsError::InvalidWelcomeMessage)?;

        if !members.iter().any(|m| m == identity) {
            return Err(MlsError::InvalidWelcomeMessage(
                "welcome is not addressed to this identity".to_string(),
            ));
        }

        state.groups.insert(
            group_id.clone(),
            GroupRecord {
                group_id: group_id.clone(),
                epoch: body.epoch,
                secrets: BTreeMap::from([(body.epoch, secret)]),
                members,
                own_identity: identity.to_vec(),
                max_past_epochs: config.max_past_epochs.min(body.max_past_epochs),
                pending: None,
            },
        );
        Ok(group_id)
    }

    async fn process_commit(&self, group_id: &[u8], commit: &[u8]) -> MlsResult<u64> {
        let mut state = self.ready()?;
        let body: CommitBody = decode(COMMIT_MAGIC, commit).map_err(MlsError::DecodingFailed)?;

        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))?;

        if body.group_id != hex::encode(group_id) {
            return Err(MlsError::InvalidMessage("commit for another group".to_string()));
        }
        if body.epoch != group.epoch + 1 {
            return Err(MlsError::InvalidMessage(format!(
                "commit for epoch {} does not follow epoch {}",
                body.epoch, group.epoch
            )));
        }

        let added = body
            .added
            .iter()
            .map(|m| hex_decode("added", m))
            .collect::<Result<Vec<_>, _>>()
            .map_err(MlsError::DecodingFailed)?;

        group.pending = None;
        group.advance(body.epoch, &added)?;
        Ok(group.epoch)
    }

    async fn encrypt_message(&self, group_id: &[u8], plaintext: &[u8]) -> MlsResult<Vec<u8>> {
        let state = self.ready()?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))?;

        let cipher = message_cipher(group.current_secret()?, group_id)?;
        let nonce = ChaCha20Poly1305::generate_nonce(OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: group_id,
                },
            )
            .map_err(|e| MlsError::Crypto(format!("encrypt failed: {}", e)))?;

        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.extend_from_slice(CIPHERTEXT_MAGIC);
        out.extend_from_slice(&group.epoch.to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt_message(
        &self,
        group_id: &[u8],
        ciphertext: &[u8],
    ) -> MlsResult<DecryptedMessage> {
        let state = self.ready()?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))?;

        if ciphertext.len() < HEADER_LEN + TAG_LEN {
            return Err(MlsError::DecodingFailed("ciphertext too short".to_string()));
        }
        if &ciphertext[..4] != CIPHERTEXT_MAGIC {
            return Err(MlsError::DecodingFailed("not an application message".to_string()));
        }

        let mut epoch_bytes = [0u8; 8];
        epoch_bytes.copy_from_slice(&ciphertext[4..12]);
        let epoch = u64::from_be_bytes(epoch_bytes);

        if epoch > group.epoch {
            return Err(MlsError::InvalidCiphertext(format!(
                "message epoch {} is ahead of group epoch {}",
                epoch, group.epoch
            )));
        }
        let secret = group.secrets.get(&epoch).ok_or(MlsError::EpochOutOfRange {
            epoch,
            min_epoch: group.epoch.saturating_sub(group.max_past_epochs),
        })?;

        let cipher = message_cipher(secret, group_id)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&ciphertext[12..HEADER_LEN]),
                Payload {
                    msg: &ciphertext[HEADER_LEN..],
                    aad: group_id,
                },
            )
            .map_err(|_| MlsError::InvalidCiphertext("authentication failed".to_string()))?;

        Ok(DecryptedMessage { plaintext, epoch })
    }

    async fn export_secret(
        &self,
        group_id: &[u8],
        label: &str,
        context: &[u8],
        length: usize,
    ) -> MlsResult<Zeroizing<Vec<u8>>> {
        let state = self.ready()?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))?;

        let mut info = label.as_bytes().to_vec();
        info.push(0);
        info.extend_from_slice(context);
        Ok(Zeroizing::new(hkdf_expand(
            group_id,
            group.current_secret()?,
            &info,
            length,
        )?))
    }

    async fn epoch(&self, group_id: &[u8]) -> MlsResult<u64> {
        let state = self.ready()?;
        state
            .groups
            .get(group_id)
            .map(|g| g.epoch)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))
    }

    async fn group_exists(&self, group_id: &[u8]) -> bool {
        self.lock().groups.contains_key(group_id)
    }

    async fn delete_group(&self, group_id: &[u8]) -> MlsResult<()> {
        let mut state = self.ready()?;
        state.groups.remove(group_id);
        Ok(())
    }

    async fn export_group_state(&self, group_id: &[u8]) -> MlsResult<Zeroizing<Vec<u8>>> {
        let state = self.ready()?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| MlsError::GroupStateNotFound(hex::encode(group_id)))?;
        Ok(Zeroizing::new(serde_json::to_vec(group)?))
    }

    async fn import_group_state(&self, blob: &[u8]) -> MlsResult<Vec<u8>> {
        let mut state = self.ready()?;
        let group: GroupRecord = serde_json::from_slice(blob)
            .map_err(|e| MlsError::DecodingFailed(format!("group state: {}", e)))?;
        let group_id = group.group_id.clone();
        state.groups.insert(group_id.clone(), group);
        Ok(group_id)
    }
}
