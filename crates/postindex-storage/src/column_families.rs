//! Column family definitions for the per-store event log.
//!
//! - events: Append-only post events keyed by sequence (Zstd compressed)
//! - log_meta: Log-level metadata such as the owning store name

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for post events
pub const CF_EVENTS: &str = "events";

/// Column family name for log metadata
pub const CF_LOG_META: &str = "log_meta";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_EVENTS, CF_LOG_META];

/// Create column family options for events (append-only, compressed)
fn events_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_EVENTS, events_options()),
        ColumnFamilyDescriptor::new(CF_LOG_META, Options::default()),
    ]
}
