//! # openagents-redirect
//!
//! Correlates an outbound redirect (an OAuth authorize URL, a payment page, a
//! device-login link) with the single callback that comes back for it.
//!
//! ## Architecture
//!
//! - `lifecycle` - `RedirectController::begin`, timeout, cancellation, cleanup
//! - `registry` - pending operations keyed by id and by routing attribute
//! - `resolution` - single-assignment outcome slot
//! - `matcher` - structural callback pattern plus caller validator
//! - `channel` - return-channel traits implemented by each transport
//! - `loopback` - local HTTP listener for desktop and CLI hosts
//! - `broadcast` - named in-process channels and same-page resume for UI hosts
//! - `scheme` - URLs handed over by the host (custom schemes, app links)
//! - `launcher` - opening the external agent
//! - `config` - environment configuration

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod launcher;
pub mod lifecycle;
pub mod loopback;
pub mod matcher;
pub mod registry;
pub mod resolution;
pub mod scheme;

pub use broadcast::{
    BroadcastHub, BroadcastOptions, BroadcastTransport, CallbackRelay, ChannelNameRegistry,
    FileStore, HostEvent, HostEventBus, KeyValueStore, MemoryStore, PendingResume,
    SamePageResume,
};
pub use channel::{ChannelBinding, ChannelDescriptor, ReturnChannel, ReturnTransport};
pub use config::{ConfigError, RedirectConfig};
pub use error::{LaunchError, RedirectError, RedirectErrorKind, ValidatorError};
pub use identity::OperationId;
pub use launcher::{CommandLauncher, DetachedSurface, ExternalSurface, Launcher, Presentation};
pub use lifecycle::{
    BeginOptions, CandidateSink, OfferOutcome, OperationHandle, PendingRegistry,
    RedirectController,
};
pub use loopback::{
    CallbackRequest, CallbackResponse, LoopbackOptions, LoopbackTransport, PortPolicy,
};
pub use matcher::{
    AsyncCallbackValidator, CallbackPattern, CallbackValidator, RejectReason, query_param,
};
pub use registry::OperationRegistry;
pub use resolution::{CancelReason, OperationState, Resolution};
pub use scheme::{Delivery, SchemeRouter, SchemeTransport};
