//! Data space credentials, kept on disk with the secret RSA-encrypted.
//!
//! Layout of the credential directory:
//!
//! - `credentials.json`: identity plus base64 ciphertext of the secret
//! - `private_key.pem` / `public_key.pem`: PKCS#1 key pair, never transmitted
use crate::error::{DemError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs1::LineEnding;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CREDENTIALS_FILE: &str = "credentials.json";
const PRIVATE_KEY_FILE: &str = "private_key.pem";
const PUBLIC_KEY_FILE: &str = "public_key.pem";
const DEFAULT_KEY_BITS: usize = 2048;

/// Encrypt-at-rest capability. Nothing outside this module depends on the
/// scheme behind it.
pub trait SecretCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| DemError::Crypto(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let private_pem = fs::read_to_string(dir.join(PRIVATE_KEY_FILE))?;
        let public_pem = fs::read_to_string(dir.join(PUBLIC_KEY_FILE))?;
        let private = RsaPrivateKey::from_pkcs1_pem(&private_pem)
            .map_err(|e| DemError::DecryptionFailed(format!("private key: {e}")))?;
        let public = RsaPublicKey::from_pkcs1_pem(&public_pem)
            .map_err(|e| DemError::DecryptionFailed(format!("public key: {e}")))?;
        Ok(Self { private, public })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let private_pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| DemError::Crypto(e.to_string()))?;
        let public_pem = self
            .public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| DemError::Crypto(e.to_string()))?;
        fs::create_dir_all(dir)?;
        write_private(&dir.join(PRIVATE_KEY_FILE), private_pem.as_bytes())?;
        fs::write(dir.join(PUBLIC_KEY_FILE), public_pem)?;
        Ok(())
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(PRIVATE_KEY_FILE).exists() && dir.join(PUBLIC_KEY_FILE).exists()
    }
}

impl SecretCipher for RsaKeyPair {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.public
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext)
            .map_err(|e| DemError::Crypto(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| DemError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    fs::write(path, content)
}

/// Identity plus the clear secret, only ever held in memory.
#[derive(Clone)]
pub struct Credential {
    pub identity: String,
    secret: String,
}

impl Credential {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("secret", &"***")
            .finish()
    }
}

/// What `credentials.json` holds.
#[derive(Deserialize, Serialize, Debug)]
struct StoredCredential {
    identity: String,
    /// Base64 of the encrypted secret
    ciphertext: String,
    /// Public key the ciphertext was produced with
    key_pair: String,
}

/// Source of interactive answers when credentials must be entered.
pub trait SecretPrompt {
    fn identity(&mut self) -> io::Result<String>;
    /// Reads a secret without echoing it.
    fn secret(&mut self, label: &str) -> io::Result<String>;
}

pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn identity(&mut self) -> io::Result<String> {
        print!("Enter your username: ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }

    fn secret(&mut self, label: &str) -> io::Result<String> {
        rpassword::prompt_password(label)
    }
}

pub struct CredentialStore {
    dir: PathBuf,
    key_bits: usize,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            key_bits: DEFAULT_KEY_BITS,
        }
    }

    /// `<config dir>/cdse-dem`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cdse-dem"))
    }

    pub fn with_key_bits(mut self, bits: usize) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials_path().exists()
    }

    fn key_pair(&self) -> Result<RsaKeyPair> {
        if RsaKeyPair::exists(&self.dir) {
            info!("Retrieving public and private keys");
            RsaKeyPair::load(&self.dir)
        } else {
            info!("Generating public and private keys");
            let keys = RsaKeyPair::generate(self.key_bits)?;
            keys.save(&self.dir)?;
            Ok(keys)
        }
    }

    /// Encrypts `secret` and persists it with `identity`. Creates the key
    /// pair on first use.
    pub fn store(&self, identity: &str, secret: &str) -> Result<()> {
        let keys = self.key_pair()?;
        let ciphertext = keys.encrypt(secret.as_bytes())?;
        let stored = StoredCredential {
            identity: identity.to_string(),
            ciphertext: BASE64.encode(ciphertext),
            key_pair: PUBLIC_KEY_FILE.to_string(),
        };

        fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(&stored)
            .map_err(|e| DemError::Crypto(e.to_string()))?;
        fs::write(self.credentials_path(), content)?;
        info!("Secret encrypted and stored for {identity}");
        Ok(())
    }

    pub fn load(&self) -> Result<Credential> {
        let content = match fs::read_to_string(self.credentials_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DemError::CredentialsMissing)
            }
            Err(e) => return Err(e.into()),
        };
        let stored: StoredCredential = serde_json::from_str(&content)
            .map_err(|e| DemError::DecryptionFailed(format!("unreadable credential file: {e}")))?;
        let ciphertext = BASE64
            .decode(stored.ciphertext.trim())
            .map_err(|e| DemError::DecryptionFailed(format!("ciphertext: {e}")))?;

        if !RsaKeyPair::exists(&self.dir) {
            return Err(DemError::DecryptionFailed("key pair is missing".to_string()));
        }
        let keys = RsaKeyPair::load(&self.dir)?;
        let secret = String::from_utf8(keys.decrypt(&ciphertext)?)
            .map_err(|_| DemError::DecryptionFailed("secret is not UTF-8".to_string()))?;

        Ok(Credential::new(stored.identity, secret))
    }

    /// Asks for identity and secret (twice) and stores them.
    pub fn enroll(&self, prompt: &mut impl SecretPrompt) -> Result<Credential> {
        info!("Please enter your username and password");
        let mut identity = prompt.identity()?;
        while !identity.contains('@') {
            warn!("Your username shall be a valid email address");
            identity = prompt.identity()?;
        }

        let secret = prompt.secret("Enter your password: ")?;
        let confirmation = prompt.secret("Re-enter your password: ")?;
        if secret != confirmation {
            return Err(DemError::SecretMismatch);
        }

        self.store(&identity, &secret)?;
        Ok(Credential::new(identity, secret))
    }

    /// Loads stored credentials, prompting only when none exist yet.
    pub fn load_or_enroll(&self, prompt: &mut impl SecretPrompt) -> Result<Credential> {
        if self.has_credentials() {
            info!("User is known, credentials are retrieved");
            self.load()
        } else {
            self.enroll(prompt)
        }
    }

    /// Deletes the stored credential and, if asked, the key pair.
    pub fn reset(&self, remove_keys: bool) -> Result<()> {
        remove_if_present(&self.credentials_path())?;
        if remove_keys {
            remove_if_present(&self.dir.join(PRIVATE_KEY_FILE))?;
            remove_if_present(&self.dir.join(PUBLIC_KEY_FILE))?;
        }
        info!("Credentials erased in {}", self.dir.display());
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
