//! Subscription handlers
//!
//! One handler per event package. It decides whether an incoming SUBSCRIBE
//! becomes a subscription and receives the callbacks of every subscription it
//! owns, always on that subscription's serializer.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::errors::{PubsubError, Result};
use crate::subscription::Subscription;
use rvoip_session_core::sip::{HeaderAccess, SipBody, SipHeader, SipRequest, SipResponse};

/// Answer of [`SubscriptionHandler::new_subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewSubscribe {
    /// Accept with 200 and keep the subscription
    Accepted,
    /// Refuse with the given final status, 500 when none is given
    Rejected(Option<u16>),
}

/// Response a handler may shape for an in-dialog SUBSCRIBE or NOTIFY
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseData {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Vec<SipHeader>,
    pub body: Option<SipBody>,
}

impl Default for ResponseData {
    fn default() -> Self {
        Self {
            status: 200,
            reason: None,
            headers: Vec::new(),
            body: None,
        }
    }
}

impl ResponseData {
    /// True when the handler asked for anything but a bare 200
    pub fn changed(&self) -> bool {
        self.status != 200 || self.reason.is_some() || !self.headers.is_empty() || self.body.is_some()
    }

    pub(crate) fn apply(self, response: &mut SipResponse) {
        if !(200..=699).contains(&self.status) {
            error!("Handler response status {} is not final, keeping {}", self.status, response.status);
        } else {
            response.status = self.status;
            response.reason = rvoip_session_core::sip::reason_phrase(self.status).to_string();
        }
        if let Some(reason) = self.reason {
            response.reason = reason;
        }
        for header in self.headers {
            response.add_header(header.name, header.value);
        }
        if self.body.is_some() {
            response.body = self.body;
        }
    }
}

/// Callbacks for one event package. Notifier callbacks and subscriber
/// callbacks share the trait; a handler implements the ones its role uses.
pub trait SubscriptionHandler: Send + Sync {
    /// Event package name, matched against the Event header
    fn event_name(&self) -> &str;

    /// Body types, `type/subtype`, this package can produce
    fn accept(&self) -> Vec<String>;

    /// Kind of event data this package produces, see [`BodyData`](crate::body::BodyData)
    fn body_type(&self) -> &str;

    /// Body type used when a SUBSCRIBE carries no Accept header
    fn default_accept(&self) -> Option<String> {
        self.accept().into_iter().next()
    }

    /// A new SUBSCRIBE arrived for this package
    fn new_subscribe(&self, _subscription: &Arc<Subscription>, _request: &SipRequest) -> NewSubscribe {
        NewSubscribe::Rejected(None)
    }

    /// The SUBSCRIBE was accepted; the initial NOTIFY is the handler's job
    fn subscription_established(&self, _subscription: &Arc<Subscription>) {}

    /// In-dialog SUBSCRIBE refreshing the subscription
    fn resubscribe(&self, _subscription: &Arc<Subscription>, _request: &SipRequest, _response: &mut ResponseData) {}

    /// The subscription expired without a refresh
    fn subscription_timeout(&self, _subscription: &Arc<Subscription>) {}

    /// The subscription reached the terminated state. `request` is the
    /// received message that ended it, if a received message did.
    fn subscription_terminated(&self, _subscription: &Arc<Subscription>, _request: Option<&SipRequest>) {}

    /// Last callback for a subscription
    fn subscription_shutdown(&self, _subscription: &Arc<Subscription>) {}

    /// Response to a NOTIFY we sent
    fn notify_response(&self, _subscription: &Arc<Subscription>, _response: &SipResponse) {}

    /// NOTIFY received on a subscription we created
    fn notify_request(&self, _subscription: &Arc<Subscription>, _request: &SipRequest, _response: &mut ResponseData) {}

    /// Our subscription is about to expire
    fn refresh_subscription(&self, subscription: &Arc<Subscription>) {
        if let Err(e) = subscription.refresh() {
            warn!("Subscription {} could not be refreshed: {}", subscription.id(), e);
        }
    }
}

impl fmt::Debug for dyn SubscriptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandler")
            .field("event", &self.event_name())
            .field("accept", &self.accept())
            .finish()
    }
}

/// Event type of an Event header value, without parameters
pub fn event_type(header: &str) -> &str {
    header.split(';').next().unwrap_or_default().trim()
}

/// Subscription handlers in registration order
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn SubscriptionHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn SubscriptionHandler>) -> Result<()> {
        let event = handler.event_name().to_string();
        if event.is_empty() {
            error!("No event package specified for subscription handler. Cannot register");
            return Err(PubsubError::MissingEventName);
        }
        if handler.accept().iter().all(|a| a.trim().is_empty()) {
            error!("Subscription handler for event {} accepts no body types", event);
            return Err(PubsubError::NoAcceptTypes(event));
        }
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.event_name() == event) {
            error!(
                "Unable to register subscription handler for event {}. A handler is already registered",
                event
            );
            return Err(PubsubError::DuplicateHandler(event));
        }
        debug!("Registered subscription handler for event {}", event);
        handlers.push(handler);
        Ok(())
    }

    pub fn unregister(&self, event: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.event_name() != event);
        handlers.len() != before
    }

    pub fn find(&self, event: &str) -> Option<Arc<dyn SubscriptionHandler>> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.event_name() == event)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }
}
