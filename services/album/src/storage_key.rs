use crate::config::UploadConfig;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Symbols a random key suffix is drawn from
const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Largest byte value that maps onto the alphabet without modulo bias (7 * 36)
const UNBIASED_LIMIT: u8 = 252;

/// Errors raised while parsing or generating storage keys
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("storage key is empty")]
    Empty,

    #[error("entropy source unavailable: {0}")]
    Entropy(#[from] rand::Error),
}

/// Opaque identifier of one uploaded item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// Accept a caller-supplied key. Blank keys are rejected.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        if raw.trim().is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entropy source shared by clones of a generator
type SharedRng = Arc<Mutex<Box<dyn RngCore + Send>>>;

/// Mints storage keys of the form `{namespace}/{timestamp_ms}-{random_id}.{extension}`
#[derive(Clone)]
pub struct KeyGenerator {
    namespace: String,
    extension: String,
    random_id_len: usize,
    rng: SharedRng,
}

impl KeyGenerator {
    /// Generator backed by the operating system's entropy source
    pub fn new(config: &UploadConfig) -> Self {
        Self::with_rng(config, OsRng)
    }

    /// Generator drawing its random suffixes from `rng`
    pub fn with_rng<R: RngCore + Send + 'static>(config: &UploadConfig, rng: R) -> Self {
        Self {
            namespace: config.namespace.clone(),
            extension: config.extension.to_lowercase(),
            random_id_len: config.random_id_len,
            rng: Arc::new(Mutex::new(Box::new(rng))),
        }
    }

    /// Generate a fresh key stamped with the current time
    pub fn generate(&self) -> Result<StorageKey, KeyError> {
        self.generate_at(Utc::now().timestamp_millis())
    }

    /// Generate a key for an explicit epoch-millisecond timestamp
    pub fn generate_at(&self, timestamp_ms: i64) -> Result<StorageKey, KeyError> {
        let random_id = random_id(&mut *self.rng.lock(), self.random_id_len)?;

        Ok(StorageKey(format!(
            "{namespace}/{timestamp}-{random_id}.{extension}",
            namespace = self.namespace,
            timestamp = timestamp_ms,
            random_id = random_id,
            extension = self.extension,
        )))
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerator")
            .field("namespace", &self.namespace)
            .field("extension", &self.extension)
            .field("random_id_len", &self.random_id_len)
            .finish_non_exhaustive()
    }
}

/// Draw `len` symbols from `[0-9a-z]` using rejection sampling
fn random_id<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Result<String, KeyError> {
    let mut id = String::with_capacity(len);
    let mut buf = [0u8; 32];

    while id.len() < len {
        rng.try_fill_bytes(&mut buf)?;
        for byte in buf.iter().copied().filter(|b| *b < UNBIASED_LIMIT) {
            if id.len() == len {
                break;
            }
            id.push(ALPHABET[(byte % 36) as usize] as char);
        }
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn generator() -> KeyGenerator {
        KeyGenerator::new(&UploadConfig::default())
    }

    /// Always reports entropy exhaustion
    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, _dest: &mut [u8]) {}

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no entropy",
            )))
        }
    }

    #[test]
    fn test_key_format() {
        let key = generator().generate_at(1_700_000_000_123).unwrap();
        let key = key.as_str();

        let rest = key.strip_prefix("wedding-uploads/1700000000123-").unwrap();
        let (random_id, ext) = rest.split_once('.').unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(random_id.len(), 13);
        assert!(random_id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_keys_are_unique() {
        let generator = generator();
        let keys: HashSet<_> = (0..10_000)
            .map(|_| generator.generate_at(42).unwrap())
            .collect();
        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn test_entropy_failure_surfaces() {
        assert!(matches!(
            random_id(&mut BrokenRng, 8),
            Err(KeyError::Entropy(_))
        ));

        let generator = KeyGenerator::with_rng(&UploadConfig::default(), BrokenRng);
        assert!(matches!(generator.generate(), Err(KeyError::Entropy(_))));
    }

    #[test]
    fn test_seeded_generator_is_deterministic() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let config = UploadConfig::default();
        let a = KeyGenerator::with_rng(&config, StdRng::seed_from_u64(7));
        let b = KeyGenerator::with_rng(&config, StdRng::seed_from_u64(7));
        assert_eq!(a.generate_at(1).unwrap(), b.generate_at(1).unwrap());
    }

    #[test]
    fn test_parse_rejects_blank() {
        assert!(matches!(StorageKey::parse(""), Err(KeyError::Empty)));
        assert!(matches!(StorageKey::parse("   "), Err(KeyError::Empty)));
        assert_eq!(StorageKey::parse("a/b.jpg").unwrap().as_str(), "a/b.jpg");
    }
}
