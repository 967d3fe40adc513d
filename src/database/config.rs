//! # Storage Configuration
//!
//! Runtime settings consumed when a database is opened. They can be set
//! field by field, through the [`DatabaseBuilder`](super::DatabaseBuilder)
//! setters, or from string pairs with [`StorageConfig::property`] (handy when
//! the settings come from a configuration file or the command line).
//!
//! ## Recognized Properties
//!
//! | Key                       | Field                | Default          |
//! |---------------------------|----------------------|------------------|
//! | `index.initial_size`      | `initial_index_size` | 1024             |
//! | `object_cache.size`       | `object_cache_size`  | 1024             |
//! | `page_pool.size`          | `page_pool_size`     | 1024             |
//! | `alloc.extension_quantum` | `extension_quantum`  | 1 MiB            |
//! | `gc.threshold`            | `gc_threshold`       | none             |
//! | `gc.background`           | `background_gc`      | false            |
//! | `file.read_only`          | `read_only`          | false            |
//! | `file.truncate`           | `truncate`           | false            |
//! | `file.lock`               | `lock_file`          | false            |
//! | `multiclient`             | `multiclient`        | false            |
//! | `oid.reuse`               | `reuse_oid`          | true             |
//! | `oid.max`                 | `max_object_oid`     | 2^31 - 1         |
//!
//! Boolean values accept `true/false`, `on/off`, `yes/no` and `1/0`. The GC
//! threshold accepts `none` or `off` to disable automatic collection.

use eyre::{bail, ensure, Result, WrapErr};

use crate::config::{
    DEFAULT_EXTENSION_QUANTUM, DEFAULT_INITIAL_INDEX_SIZE, DEFAULT_OBJECT_CACHE_SIZE,
    DEFAULT_PAGE_POOL_SIZE, MAX_OBJECT_OID, MIN_PAGE_POOL_SIZE, PAGE_SIZE,
};
use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Object index slots reserved when a new file is created.
    pub initial_index_size: u32,
    pub object_cache_size: usize,
    /// Page frames kept by the page pool.
    pub page_pool_size: usize,
    /// Minimum number of bytes the file grows by when the allocator runs out.
    pub extension_quantum: u64,
    /// Allocation volume that triggers a collection; `None` disables it.
    pub gc_threshold: Option<u64>,
    pub background_gc: bool,
    pub read_only: bool,
    /// Discard the file contents at open.
    pub truncate: bool,
    /// Create `<path>.lock` exclusively while the database is open.
    pub lock_file: bool,
    pub multiclient: bool,
    pub reuse_oid: bool,
    pub max_object_oid: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            initial_index_size: DEFAULT_INITIAL_INDEX_SIZE,
            object_cache_size: DEFAULT_OBJECT_CACHE_SIZE,
            page_pool_size: DEFAULT_PAGE_POOL_SIZE,
            extension_quantum: DEFAULT_EXTENSION_QUANTUM,
            gc_threshold: None,
            background_gc: false,
            read_only: false,
            truncate: false,
            lock_file: false,
            multiclient: false,
            reuse_oid: true,
            max_object_oid: MAX_OBJECT_OID,
        }
    }
}

impl StorageConfig {
    /// Applies one `key = value` setting.
    pub fn property(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key.trim() {
            "index.initial_size" => self.initial_index_size = parse_number(key, value)?,
            "object_cache.size" => self.object_cache_size = parse_number(key, value)?,
            "page_pool.size" => self.page_pool_size = parse_number(key, value)?,
            "alloc.extension_quantum" => self.extension_quantum = parse_number(key, value)?,
            "gc.threshold" => {
                self.gc_threshold = match value.to_ascii_lowercase().as_str() {
                    "none" | "off" => None,
                    _ => Some(parse_number(key, value)?),
                }
            }
            "gc.background" => self.background_gc = parse_bool(key, value)?,
            "file.read_only" => self.read_only = parse_bool(key, value)?,
            "file.truncate" => self.truncate = parse_bool(key, value)?,
            "file.lock" => self.lock_file = parse_bool(key, value)?,
            "multiclient" => self.multiclient = parse_bool(key, value)?,
            "oid.reuse" => self.reuse_oid = parse_bool(key, value)?,
            "oid.max" => self.max_object_oid = parse_number(key, value)?,
            other => bail!("unknown storage property '{}'", other),
        }
        Ok(())
    }

    /// Rejects combinations that cannot be opened.
    pub fn validate(&self) -> Result<()> {
        if self.background_gc && self.multiclient {
            bail!(StorageError::InvalidOperation(
                "background GC cannot be combined with multiclient mode"
            ));
        }
        if self.read_only && self.truncate {
            bail!(StorageError::InvalidOperation(
                "a read-only database cannot be truncated"
            ));
        }
        ensure!(
            self.page_pool_size >= MIN_PAGE_POOL_SIZE,
            "page pool of {} frames is below the minimum of {}",
            self.page_pool_size,
            MIN_PAGE_POOL_SIZE
        );
        ensure!(
            self.extension_quantum >= PAGE_SIZE as u64,
            "extension quantum {} is smaller than a page",
            self.extension_quantum
        );
        ensure!(
            self.max_object_oid > 0 && self.max_object_oid <= MAX_OBJECT_OID,
            "max object id {} is out of range",
            self.max_object_oid
        );
        Ok(())
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let digits: String = value.chars().filter(|c| *c != '_').collect();
    digits
        .parse()
        .wrap_err_with(|| format!("invalid value '{}' for '{}'", value, key))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => bail!("invalid boolean '{}' for '{}'", value, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;

    #[test]
    fn defaults_are_valid() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.reuse_oid);
        assert_eq!(config.gc_threshold, None);
    }

    #[test]
    fn property_sets_every_field() {
        let mut config = StorageConfig::default();
        config.property("index.initial_size", "8192").unwrap();
        config.property("object_cache.size", "64").unwrap();
        config.property("page_pool.size", "128").unwrap();
        config.property("alloc.extension_quantum", "4_194_304").unwrap();
        config.property("gc.threshold", "65536").unwrap();
        config.property("gc.background", "on").unwrap();
        config.property("file.read_only", "no").unwrap();
        config.property("file.truncate", "1").unwrap();
        config.property("file.lock", "TRUE").unwrap();
        config.property("multiclient", "false").unwrap();
        config.property("oid.reuse", "off").unwrap();
        config.property(" oid.max ", " 100000 ").unwrap();

        assert_eq!(config.initial_index_size, 8192);
        assert_eq!(config.object_cache_size, 64);
        assert_eq!(config.page_pool_size, 128);
        assert_eq!(config.extension_quantum, 4 * 1024 * 1024);
        assert_eq!(config.gc_threshold, Some(65536));
        assert!(config.background_gc);
        assert!(!config.read_only);
        assert!(config.truncate);
        assert!(config.lock_file);
        assert!(!config.multiclient);
        assert!(!config.reuse_oid);
        assert_eq!(config.max_object_oid, 100_000);
    }

    #[test]
    fn gc_threshold_can_be_disabled() {
        let mut config = StorageConfig::default();
        config.property("gc.threshold", "1024").unwrap();
        config.property("gc.threshold", "None").unwrap();
        assert_eq!(config.gc_threshold, None);
    }

    #[test]
    fn bad_properties_are_rejected() {
        let mut config = StorageConfig::default();
        assert!(config.property("cache.bogus", "1").is_err());
        assert!(config.property("page_pool.size", "lots").is_err());
        assert!(config.property("file.lock", "maybe").is_err());
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    fn background_gc_conflicts_with_multiclient() {
        let config = StorageConfig {
            background_gc: true,
            multiclient: true,
            ..StorageConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(StorageError::InvalidOperation(_))
        ));
    }

    #[test]
    fn tiny_page_pool_is_rejected() {
        let config = StorageConfig {
            page_pool_size: 2,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
