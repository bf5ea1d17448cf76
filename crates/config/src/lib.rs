//! Configuration for hublink: schema, file discovery, env substitution and
//! the built-in vendor region table.

pub mod env_subst;
pub mod loader;
pub mod regions;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, load_config, set_config_dir,
    },
    regions::{region_ids, resolve_region},
    schema::{
        DiagnosticsConfig, DriverConfig, HublinkConfig, ListenerConfig, RegionConfig,
        ResourceKind, ResourceMapping, WebhookConfig,
    },
};
