use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::info;

use seqmirror_store::{
    DryRunStore, HttpStore, HttpStoreConfig, LocalStore, ObjectStore, DEFAULT_MULTIPART_THRESHOLD,
    DEFAULT_PART_SIZE,
};

/// Storage backend selected by the `store.kind` key.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Http {
        endpoint: String,
        access_key_id: String,
        access_key_secret: String,
    },
    Local {
        root: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    pub store: StoreConfig,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    #[serde(default = "default_part_size")]
    pub preferred_part_size_bytes: u64,
}

fn default_multipart_threshold() -> u64 {
    DEFAULT_MULTIPART_THRESHOLD
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

impl MirrorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("config_unreadable: {}: {}", path.display(), e))?;
        let config = Self::from_yaml_str(&raw)
            .map_err(|e| anyhow!("config_invalid: {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let mut config: MirrorConfig = serde_yaml::from_str(raw)?;
        // Relative local roots are taken from the working directory.
        if let StoreConfig::Local { root } = &mut config.store {
            if root.is_relative() {
                *root = std::env::current_dir()?.join(&*root);
            }
        }
        if config.preferred_part_size_bytes == 0 {
            return Err(anyhow!("preferred_part_size_bytes must be positive"));
        }
        Ok(config)
    }

    /// Connect the configured backend for `bucket`, wrapped for dry runs.
    pub fn build_store(&self, bucket: &str, dry_run: bool) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match &self.store {
            StoreConfig::Http {
                endpoint,
                access_key_id,
                access_key_secret,
            } => {
                let mut http =
                    HttpStoreConfig::new(endpoint, bucket, access_key_id, access_key_secret);
                http.preferred_part_size = self.preferred_part_size_bytes;
                Arc::new(HttpStore::new(http)?)
            }
            StoreConfig::Local { root } => Arc::new(
                LocalStore::new(root, bucket)?.with_part_size(self.preferred_part_size_bytes),
            ),
        };
        if dry_run {
            return Ok(Arc::new(DryRunStore::new(store)));
        }
        Ok(store)
    }
}

/// List the bucket root once; credentials, endpoint and bucket are all
/// exercised by that call.
pub fn validate_store(store: &dyn ObjectStore) -> Result<()> {
    let entries = store
        .list_children("")
        .map_err(|e| anyhow!("store_unreachable: bucket '{}': {}", store.bucket(), e))?;
    info!(
        bucket = store.bucket(),
        entries = entries.len(),
        "storage credentials verified"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;

    #[test]
    fn http_config_parses_with_defaults() {
        let config = MirrorConfig::from_yaml_str(
            "store:\n  kind: http\n  endpoint: https://gateway.example\n  access_key_id: AKID\n  access_key_secret: s3cret\n",
        )
        .expect("parse");
        assert_eq!(
            config.store,
            StoreConfig::Http {
                endpoint: "https://gateway.example".to_string(),
                access_key_id: "AKID".to_string(),
                access_key_secret: "s3cret".to_string(),
            }
        );
        assert_eq!(config.multipart_threshold_bytes, DEFAULT_MULTIPART_THRESHOLD);
        assert_eq!(config.preferred_part_size_bytes, DEFAULT_PART_SIZE);
    }

    #[test]
    fn unknown_kind_and_missing_keys_are_rejected() {
        assert!(MirrorConfig::from_yaml_str("store:\n  kind: ftp\n  root: /tmp\n").is_err());
        assert!(MirrorConfig::from_yaml_str("store:\n  kind: http\n  endpoint: x\n").is_err());
        assert!(MirrorConfig::from_yaml_str(
            "store:\n  kind: local\n  root: /tmp\npreferred_part_size_bytes: 0\n"
        )
        .is_err());
    }

    #[test]
    fn local_store_is_built_validated_and_wrapped_for_dry_run() {
        let root = scratch_dir("config_local");
        let path = root.join("seqmirror.yaml");
        fs::write(
            &path,
            format!(
                "store:\n  kind: local\n  root: {}\nmultipart_threshold_bytes: 64\n",
                root.display()
            ),
        )
        .expect("write config");
        let config = MirrorConfig::load(&path).expect("load");
        assert_eq!(config.multipart_threshold_bytes, 64);

        let store = config.build_store("runs", false).expect("store");
        assert!(!store.is_dry_run());
        validate_store(store.as_ref()).expect("valid");
        assert!(root.join("runs").is_dir());

        let dry = config.build_store("runs", true).expect("dry store");
        assert!(dry.is_dry_run());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_local_root_is_fatal() {
        let root = scratch_dir("config_missing_root");
        let config = MirrorConfig {
            store: StoreConfig::Local {
                root: root.join("absent"),
            },
            multipart_threshold_bytes: DEFAULT_MULTIPART_THRESHOLD,
            preferred_part_size_bytes: DEFAULT_PART_SIZE,
        };
        let err = config.build_store("runs", false).err().expect("must fail");
        assert!(err.to_string().contains("not a directory"), "{}", err);
        assert!(MirrorConfig::load(&root.join("nope.yaml"))
            .expect_err("missing file")
            .to_string()
            .contains("config_unreadable"));
        let _ = fs::remove_dir_all(root);
    }
}
