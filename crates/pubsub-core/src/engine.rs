//! Pub/sub engine
//!
//! [`PubsubEngine`] owns the subscription handler, body generator and
//! publish handler registries plus the live subscriptions. The protocol
//! engine hands it SUBSCRIBE, NOTIFY and PUBLISH requests and the responses
//! to requests subscriptions sent.

use std::sync::Arc;

use dashmap::DashMap;
use rvoip_session_core::dialog::dialog_key;
use rvoip_session_core::sip::{
    new_tag, HeaderAccess, Method, NameAddr, SipRequest, SipResponse, SipSender,
};
use tracing::{debug, info, warn};

use crate::body::{BodyData, BodyGenerator, BodyRegistry, BodySupplement};
use crate::config::PubsubConfig;
use crate::errors::{PubsubError, Result};
use crate::handler::{event_type, HandlerRegistry, SubscriptionHandler};
use crate::publish::{PublishEntry, PublishHandler, PublishRegistry};
use crate::subscription::{request_expires, PubsubContext, Subscription, SubscriptionRole};

pub struct PubsubEngine {
    handlers: HandlerRegistry,
    publishers: PublishRegistry,
    ctx: Arc<PubsubContext>,
}

impl PubsubEngine {
    pub fn new(config: PubsubConfig, sender: Arc<dyn SipSender>) -> Arc<Self> {
        info!(
            "Pub/sub engine started (subscriptions {})",
            if config.allow_subscribe { "allowed" } else { "refused" }
        );
        Arc::new(Self {
            handlers: HandlerRegistry::new(),
            publishers: PublishRegistry::new(),
            ctx: Arc::new(PubsubContext {
                sender,
                bodies: Arc::new(BodyRegistry::new()),
                subscriptions: DashMap::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &PubsubConfig {
        &self.ctx.config
    }

    pub fn bodies(&self) -> &Arc<BodyRegistry> {
        &self.ctx.bodies
    }

    // Registration

    pub fn register_subscription_handler(&self, handler: Arc<dyn SubscriptionHandler>) -> Result<()> {
        self.handlers.register(handler)
    }

    pub fn unregister_subscription_handler(&self, event: &str) -> bool {
        self.handlers.unregister(event)
    }

    pub fn register_body_generator(&self, generator: Arc<dyn BodyGenerator>) -> Result<()> {
        self.ctx.bodies.register_generator(generator)
    }

    pub fn unregister_body_generator(&self, media_type: &str, subtype: &str) -> bool {
        self.ctx.bodies.unregister_generator(media_type, subtype)
    }

    pub fn is_body_generator_registered(&self, media_type: &str, subtype: &str) -> bool {
        self.ctx.bodies.is_generator_registered(media_type, subtype)
    }

    pub fn register_body_supplement(&self, supplement: Arc<dyn BodySupplement>) {
        self.ctx.bodies.register_supplement(supplement)
    }

    pub fn unregister_body_supplement(&self, supplement: &Arc<dyn BodySupplement>) -> bool {
        self.ctx.bodies.unregister_supplement(supplement)
    }

    pub fn register_publish_handler(&self, handler: Arc<dyn PublishHandler>) -> Result<()> {
        self.publishers.register(handler)
    }

    pub fn unregister_publish_handler(&self, event: &str) -> bool {
        self.publishers.unregister(event)
    }

    /// Publish handler for `event` with its live publications
    pub fn publish_entry(&self, event: &str) -> Option<Arc<PublishEntry>> {
        self.publishers.find(event)
    }

    pub fn generate_body_content(&self, media_type: &str, subtype: &str, data: &BodyData) -> Result<String> {
        self.ctx.bodies.generate_body_content(media_type, subtype, data)
    }

    // Subscriptions

    pub fn subscription(&self, dialog_key: &str) -> Option<Arc<Subscription>> {
        self.ctx.subscriptions.get(dialog_key).map(|s| s.value().clone())
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.ctx.subscriptions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.ctx.subscriptions.len()
    }

    /// Create a subscription to `remote` for `event`. Send it with [`Subscription::subscribe`].
    pub fn create_subscription(
        &self,
        event: &str,
        endpoint: &str,
        local: NameAddr,
        remote: NameAddr,
    ) -> Result<Arc<Subscription>> {
        let handler = self
            .handlers
            .find(event)
            .ok_or_else(|| PubsubError::NoHandler(event.to_string()))?;
        let subscription = Subscription::new_subscriber(self.ctx.clone(), handler, endpoint, local, remote);
        self.ctx
            .subscriptions
            .insert(subscription.dialog_key().to_string(), subscription.clone());
        Ok(subscription)
    }

    fn reply(&self, request: &SipRequest, response: SipResponse) {
        if let Err(e) = self.ctx.sender.send_response(&response) {
            warn!("Failed to answer {} with {}: {}", request.method, response.status, e);
        }
    }

    fn reply_stateless(&self, request: &SipRequest, status: u16) {
        let response = SipResponse::for_request(request, status).with_to_tag(Some(new_tag()));
        self.reply(request, response);
    }

    /// Route a received request. Returns false when it is not pub/sub business.
    pub async fn on_rx_request(&self, endpoint: &str, request: SipRequest) -> Result<bool> {
        match request.method {
            Method::Subscribe if request.is_in_dialog() => {
                let Some(subscription) = self.find_for_request(&request) else {
                    self.reply_stateless(&request, 481);
                    return Ok(true);
                };
                if subscription.role() != SubscriptionRole::Notifier {
                    self.reply(&request, subscription.response_to(&request, 403));
                    return Ok(true);
                }
                subscription
                    .push_task_synchronous(move |s| s.on_rx_refresh(&request))
                    .await?;
                Ok(true)
            }
            Method::Subscribe => {
                self.on_rx_subscribe(endpoint, request).await?;
                Ok(true)
            }
            Method::Notify if request.is_in_dialog() => {
                let Some(subscription) = self.find_for_request(&request) else {
                    return Ok(false);
                };
                if subscription.role() != SubscriptionRole::Subscriber {
                    self.reply(&request, subscription.response_to(&request, 403));
                    return Ok(true);
                }
                subscription
                    .push_task_synchronous(move |s| s.on_rx_notify(&request))
                    .await?;
                Ok(true)
            }
            Method::Publish => {
                self.publishers.on_rx_publish(
                    &self.ctx.sender,
                    self.ctx.config.default_publish_expires,
                    endpoint,
                    &request,
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Route a response to a request a subscription sent
    pub async fn on_rx_response(&self, response: SipResponse) -> Result<bool> {
        let key = dialog_key(&response.call_id, response.from_tag.as_deref().unwrap_or_default());
        let Some(subscription) = self.subscription(&key) else {
            return Ok(false);
        };
        subscription
            .push_task_synchronous(move |s| s.on_rx_response(&response))
            .await?;
        Ok(true)
    }

    fn find_for_request(&self, request: &SipRequest) -> Option<Arc<Subscription>> {
        let key = dialog_key(&request.call_id, request.to_tag.as_deref().unwrap_or_default());
        self.subscription(&key)
    }

    async fn on_rx_subscribe(&self, endpoint: &str, request: SipRequest) -> Result<()> {
        let config = &self.ctx.config;
        if !config.subscriptions_allowed(endpoint) {
            warn!("Subscriptions not permitted for endpoint {}", endpoint);
            self.reply_stateless(&request, 603);
            return Ok(());
        }

        if !matches!(request.uri_scheme().as_deref(), Some("sip") | Some("sips")) {
            warn!("Request URI '{}' is not a sip: or sips: URI", request.uri);
            self.reply_stateless(&request, 416);
            return Ok(());
        }

        let Some(event) = request.header("Event").map(event_type).filter(|e| !e.is_empty()) else {
            warn!("Incoming SUBSCRIBE request from {} with no Event header", endpoint);
            self.reply_stateless(&request, 489);
            return Ok(());
        };

        let expires = match request_expires(&request) {
            Some(0) => {
                debug!("Subscription request from {} rejected. Expiration of 0 is invalid", endpoint);
                self.reply_stateless(&request, 400);
                return Ok(());
            }
            Some(expires) if expires < config.min_expiry => {
                warn!(
                    "Subscription expiration {} is too brief for endpoint {}. Minimum is {}",
                    expires, endpoint, config.min_expiry
                );
                let response = SipResponse::for_request(&request, 423)
                    .with_to_tag(Some(new_tag()))
                    .with_header("Min-Expires", config.min_expiry.to_string());
                self.reply(&request, response);
                return Ok(());
            }
            Some(expires) => expires,
            None => config.default_expires,
        };

        let Some(handler) = self.handlers.find(event) else {
            warn!("No registered subscribe handler for event {} from {}", event, endpoint);
            self.reply_stateless(&request, 489);
            return Ok(());
        };

        let mut accept: Vec<String> = request
            .headers_named("Accept")
            .flat_map(|h| h.value.split(','))
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if accept.is_empty() {
            accept.extend(handler.default_accept());
        }
        let Some(generator) = self.ctx.bodies.find_for_accept(&accept, handler.body_type()) else {
            warn!(
                "No body generator for event {} accepts any of {:?} from {}",
                event, accept, endpoint
            );
            self.reply_stateless(&request, 400);
            return Ok(());
        };

        let subscription = Subscription::new_notifier(
            self.ctx.clone(),
            handler,
            generator,
            endpoint,
            &request,
            expires,
        );
        self.ctx
            .subscriptions
            .insert(subscription.dialog_key().to_string(), subscription.clone());
        subscription
            .push_task_synchronous(move |s| s.on_rx_new_subscribe(&request))
            .await?;
        Ok(())
    }
}
