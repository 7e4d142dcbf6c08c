//! # Pubsub-Core
//!
//! SIP event framework for RVoIP: SUBSCRIBE/NOTIFY subscriptions in both the
//! notifier and the subscriber role, NOTIFY body generation and PUBLISH
//! handling.
//!
//! This crate provides:
//! - Subscription handlers registered per event package
//! - Body generators per content type, with body supplements layered on top
//! - Subscriptions with their own serializer, expiry and refresh timers
//! - Publish handlers with entity tag tracking and publication expiry
//! - The `application/simple-message-summary` body used by message waiting
//!
//! ## Architecture
//!
//! The protocol engine hands SUBSCRIBE, NOTIFY and PUBLISH requests to the
//! [`PubsubEngine`] along with the responses to requests subscriptions sent.
//! Outgoing messages leave through the same
//! [`SipSender`](rvoip_session_core::sip::SipSender) seam sessions use.

pub mod body;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handler;
pub mod publish;
pub mod subscription;
pub mod summary;

pub use body::{BodyData, BodyGenerator, BodyRegistry, BodySupplement};
pub use self::config::PubsubConfig;
pub use engine::PubsubEngine;
pub use errors::{PubsubError, Result};
pub use handler::{NewSubscribe, ResponseData, SubscriptionHandler};
pub use publish::{Publication, PublishHandler, PublishState, PublishType};
pub use subscription::{Subscription, SubscriptionId, SubscriptionRole, SubscriptionState};
pub use summary::{MessageSummary, MessageSummaryGenerator};
