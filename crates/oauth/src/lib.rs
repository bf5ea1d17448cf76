//! Vendor cloud sessions: token exchange, request signing, persisted
//! session metadata and the registry of live clients.

pub mod client;
pub mod error;
pub mod intent;
pub mod registry;
pub mod sessions;
pub mod signer;
pub mod store;
pub mod token;

pub use {
    client::{ClientEvent, ClientState, OAuth2Client, SessionInfo},
    error::{Error, Result},
    intent::{
        ApiResponse, DEVICE_OFFLINE_CODE, DeviceInfo, DeviceInfoPage, DeviceInfoQuery, Intent,
        ResourceRequest, ResourceSelector, ResourceValue,
    },
    registry::{SessionKey, SessionRegistry},
    sessions::{SESSIONS_KEY, SavedSession, SessionBook, SessionSet},
    signer::{RequestSigner, SignedHeaders},
    store::{FileStore, KeyValueStore, MemoryStore},
    token::OAuth2Token,
};
