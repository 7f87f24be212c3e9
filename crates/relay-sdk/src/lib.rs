//! relay-sdk - the messaging-platform surface consumed by the maskrelay fleet.
//!
//! The relay core talks to the hosting platform exclusively through the
//! [`PlatformClient`] trait defined here. Two implementations ship with the
//! crate: an HTTP long-polling client for the real platform (behind the
//! `http` feature) and an in-memory [`mock::MockClient`] used by the
//! integration tests.

mod client;
mod error;
pub mod mock;
mod types;

#[cfg(feature = "http")]
pub mod http;

pub use client::{ClientFactory, PlatformClient};
pub use error::SdkError;
pub use types::{
    BotCommand, BotProfile, ButtonGrid, CopyRequest, Entity, EntityKind, InboundMessage,
    InlineButton, MediaKind, MediaRef, PeerInfo, Sent, Update, VoicePayload,
};
