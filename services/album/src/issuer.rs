use crate::config::UploadConfig;
use crate::storage_key::{KeyError, KeyGenerator, StorageKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Route the issued URLs point at
pub const STORE_PATH: &str = "/store";

/// Errors raised while minting an upload target
#[derive(Error, Debug)]
pub enum IssueError {
    #[error("failed to generate storage key: {0}")]
    Key(#[from] KeyError),
}

/// Capability handed to a client for a single upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    /// Locally routable URL the payload should be PUT to
    pub target_url: String,
    /// Key the payload will be stored under
    pub key: StorageKey,
}

/// Mints upload targets. Never touches the store.
#[derive(Debug, Clone)]
pub struct UploadTargetIssuer {
    keys: KeyGenerator,
}

impl UploadTargetIssuer {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            keys: KeyGenerator::new(config),
        }
    }

    /// Issuer minting keys from an existing generator
    pub fn with_key_generator(keys: KeyGenerator) -> Self {
        Self { keys }
    }

    /// Produce a fresh key and the URL that routes it to the store
    #[instrument(skip(self))]
    pub fn issue(&self) -> Result<UploadTarget, IssueError> {
        let key = self.keys.generate()?;
        let target_url = target_url_for(&key);

        debug!(key = %key, "Issued upload target");
        metrics::counter!("album_targets_issued_total").increment(1);

        Ok(UploadTarget { target_url, key })
    }
}

/// Build `/store?key=<percent-encoded key>`
pub fn target_url_for(key: &StorageKey) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("key", key.as_str())
        .finish();
    format!("{STORE_PATH}?{query}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_target_url_embeds_key() {
        let issuer = UploadTargetIssuer::new(&UploadConfig::default());
        let target = issuer.issue().unwrap();

        assert!(target.target_url.starts_with("/store?key=wedding-uploads%2F"));

        let (_, query) = target.target_url.split_once('?').unwrap();
        let recovered: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        assert_eq!(recovered, vec![("key".to_string(), target.key.to_string())]);
    }

    #[test]
    fn test_sequential_issues_are_distinct() {
        let issuer = UploadTargetIssuer::new(&UploadConfig::default());
        let keys: HashSet<_> = (0..1000).map(|_| issuer.issue().unwrap().key).collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_injected_generator_drives_keys() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let config = UploadConfig::default();
        let issuer = UploadTargetIssuer::with_key_generator(KeyGenerator::with_rng(
            &config,
            StdRng::seed_from_u64(11),
        ));
        let twin = KeyGenerator::with_rng(&config, StdRng::seed_from_u64(11));

        let issued = issuer.issue().unwrap().key;
        let expected = twin.generate_at(0).unwrap();

        let suffix = |key: &StorageKey| key.as_str().rsplit_once('-').unwrap().1.to_string();
        assert_eq!(suffix(&issued), suffix(&expected));
    }
}
