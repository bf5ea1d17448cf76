//! Gateway: device drivers, webhook registration and dispatch, the
//! diagnostic listener and the pairing flow.
//!
//! Lifecycle:
//! 1. Load config, open the store
//! 2. Restore saved sessions, install drivers, reattach paired devices
//! 3. Mount the webhook receiver and keep one registration alive
//! 4. Follow the store file so sessions and devices changed by other
//!    `hublink` processes reach the registrar and the drivers
//! 5. Optionally start the diagnostic listener
//! 6. On ctrl-c, drop the registration and cancel pending retries
//!
//! Vendor sessions and signing live in `hublink-oauth`.

pub mod device;
pub mod diag;
pub mod dispatch;
pub mod listener;
pub mod pairing;
pub mod server;
pub mod state;
pub mod watcher;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use {
    device::{CapabilitySetter, CapabilityValue, DeviceLifecycle, DriverLifecycle, PairableDevice},
    dispatch::{WebhookDispatcher, WebhookMessage},
    pairing::{PairingError, PairingEvent, PairingSession, PairingStep},
    state::{AppState, PairedDevice, StoreSync},
};
