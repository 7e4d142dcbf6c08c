//! Subscriptions
//!
//! A [`Subscription`] is one SUBSCRIBE dialog, either one we serve
//! (notifier) or one we created (subscriber). Every state change and every
//! handler callback runs on the subscription's own serializer, the same way
//! session work runs on the session serializer.
//!
//! State moves `Pending -> Active -> Terminated`. Reaching `Terminated`
//! cancels the expiry or refresh timer, removes the subscription from the
//! engine and calls `subscription_terminated` followed by
//! `subscription_shutdown` on the handler, exactly once.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rvoip_infra_common::{schedule, Datastore, DatastoreContainer, ScheduledTask, Serializer};
use rvoip_session_core::dialog::dialog_key;
use rvoip_session_core::sip::{
    new_tag, HeaderAccess, Method, NameAddr, SipBody, SipRequest, SipResponse, SipSender,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::body::{BodyData, BodyGenerator, BodyRegistry};
use crate::config::PubsubConfig;
use crate::errors::{PubsubError, Result};
use crate::handler::{NewSubscribe, ResponseData, SubscriptionHandler};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new() -> Self {
        SubscriptionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRole {
    /// We received the SUBSCRIBE and send NOTIFYs
    Notifier,
    /// We sent the SUBSCRIBE and receive NOTIFYs
    Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Terminated,
}

/// Engine collaborators shared by every subscription
pub(crate) struct PubsubContext {
    pub sender: Arc<dyn SipSender>,
    pub bodies: Arc<BodyRegistry>,
    pub subscriptions: DashMap<String, Arc<Subscription>>,
    pub config: PubsubConfig,
}

struct SubscriptionDialog {
    call_id: String,
    local: NameAddr,
    local_tag: String,
    remote: NameAddr,
    remote_tag: Option<String>,
    /// Request-URI for requests we send in the dialog
    target: String,
    local_cseq: u32,
}

struct Lifetime {
    expires: u32,
    refreshed_at: Instant,
}

pub struct Subscription {
    id: SubscriptionId,
    weak_self: Weak<Subscription>,
    role: SubscriptionRole,
    endpoint: String,
    resource: String,
    handler: Arc<dyn SubscriptionHandler>,
    generator: Option<Arc<dyn BodyGenerator>>,
    serializer: Serializer,
    datastores: DatastoreContainer,
    ctx: Arc<PubsubContext>,
    key: String,
    dialog: Mutex<SubscriptionDialog>,
    state: Mutex<SubscriptionState>,
    lifetime: Mutex<Lifetime>,
    timer: Mutex<Option<ScheduledTask>>,
    /// CSeq of the SUBSCRIBE we are waiting on
    pending_subscribe: Mutex<Option<u32>>,
}

impl Subscription {
    fn alloc(
        ctx: Arc<PubsubContext>,
        role: SubscriptionRole,
        endpoint: &str,
        resource: String,
        handler: Arc<dyn SubscriptionHandler>,
        generator: Option<Arc<dyn BodyGenerator>>,
        dialog: SubscriptionDialog,
        expires: u32,
    ) -> Arc<Self> {
        let id = SubscriptionId::new();
        let serializer = Serializer::new(format!("pubsub/{}-{}", endpoint, &id.0[..8]));
        let key = dialog_key(&dialog.call_id, &dialog.local_tag);
        let subscription = Arc::new_cyclic(|weak| Subscription {
            id,
            weak_self: weak.clone(),
            role,
            endpoint: endpoint.to_string(),
            resource,
            handler,
            generator,
            serializer,
            datastores: DatastoreContainer::new(),
            ctx,
            key,
            dialog: Mutex::new(dialog),
            state: Mutex::new(SubscriptionState::Pending),
            lifetime: Mutex::new(Lifetime {
                expires,
                refreshed_at: Instant::now(),
            }),
            timer: Mutex::new(None),
            pending_subscribe: Mutex::new(None),
        });
        info!(
            "Created {:?} subscription {} for event {} on endpoint {}",
            role,
            subscription.id,
            subscription.handler.event_name(),
            endpoint
        );
        subscription
    }

    /// Subscription serving a received SUBSCRIBE
    pub(crate) fn new_notifier(
        ctx: Arc<PubsubContext>,
        handler: Arc<dyn SubscriptionHandler>,
        generator: Arc<dyn BodyGenerator>,
        endpoint: &str,
        request: &SipRequest,
        expires: u32,
    ) -> Arc<Self> {
        let target = request
            .header("Contact")
            .map(|c| NameAddr::parse(c).uri)
            .unwrap_or_else(|| request.from.uri.clone());
        let dialog = SubscriptionDialog {
            call_id: request.call_id.clone(),
            local: request.to.clone(),
            local_tag: new_tag(),
            remote: request.from.clone(),
            remote_tag: request.from_tag.clone(),
            target,
            local_cseq: 0,
        };
        let resource = request.uri_user().unwrap_or_default().to_string();
        Self::alloc(
            ctx,
            SubscriptionRole::Notifier,
            endpoint,
            resource,
            handler,
            Some(generator),
            dialog,
            expires,
        )
    }

    /// Subscription we will send a SUBSCRIBE for
    pub(crate) fn new_subscriber(
        ctx: Arc<PubsubContext>,
        handler: Arc<dyn SubscriptionHandler>,
        endpoint: &str,
        local: NameAddr,
        remote: NameAddr,
    ) -> Arc<Self> {
        let expires = ctx.config.default_expires;
        let resource = remote.user().unwrap_or_default().to_string();
        let dialog = SubscriptionDialog {
            call_id: Uuid::new_v4().to_string(),
            local,
            local_tag: new_tag(),
            target: remote.uri.clone(),
            remote,
            remote_tag: None,
            local_cseq: 0,
        };
        Self::alloc(
            ctx,
            SubscriptionRole::Subscriber,
            endpoint,
            resource,
            handler,
            None,
            dialog,
            expires,
        )
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Strong handle to this subscription, `None` while it is being dropped
    pub fn arc(&self) -> Option<Arc<Subscription>> {
        self.weak_self.upgrade()
    }

    pub fn role(&self) -> SubscriptionRole {
        self.role
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// User part of the subscribed URI
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn handler(&self) -> &Arc<dyn SubscriptionHandler> {
        &self.handler
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub fn dialog_key(&self) -> &str {
        &self.key
    }

    pub fn call_id(&self) -> String {
        self.dialog.lock().call_id.clone()
    }

    pub fn local_tag(&self) -> String {
        self.dialog.lock().local_tag.clone()
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SubscriptionState::Terminated
    }

    pub fn expires(&self) -> u32 {
        self.lifetime.lock().expires
    }

    /// Seconds left before the subscription expires
    pub fn remaining(&self) -> u32 {
        let lifetime = self.lifetime.lock();
        let elapsed = lifetime.refreshed_at.elapsed().as_secs();
        u64::from(lifetime.expires).saturating_sub(elapsed) as u32
    }

    /// Media type of the bodies this subscription sends
    pub fn body_type(&self) -> Option<&str> {
        self.generator.as_deref().map(|g| g.media_type())
    }

    pub fn body_subtype(&self) -> Option<&str> {
        self.generator.as_deref().map(|g| g.subtype())
    }

    // Datastores

    pub fn datastores(&self) -> &DatastoreContainer {
        &self.datastores
    }

    pub fn add_datastore(&self, datastore: Arc<Datastore>) -> Result<()> {
        Ok(self.datastores.add(datastore)?)
    }

    pub fn get_datastore(&self, uid: &str) -> Option<Arc<Datastore>> {
        self.datastores.find(uid)
    }

    pub fn remove_datastore(&self, uid: &str) -> Option<Arc<Datastore>> {
        self.datastores.remove(uid)
    }

    // Tasks

    pub fn push_task<F>(self: &Arc<Self>, task: F) -> Result<()>
    where
        F: FnOnce(&Arc<Subscription>) + Send + 'static,
    {
        let subscription = self.clone();
        Ok(self.serializer.push_task(async move { task(&subscription) })?)
    }

    pub async fn push_task_synchronous<F, T>(self: &Arc<Self>, task: F) -> Result<T>
    where
        F: FnOnce(&Arc<Subscription>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let subscription = self.clone();
        Ok(self
            .serializer
            .push_task_synchronous(async move { task(&subscription) })
            .await?)
    }

    /// Wait until everything queued so far has run
    pub async fn barrier(self: &Arc<Self>) -> Result<()> {
        self.push_task_synchronous(|_| ()).await
    }

    // Sending

    fn next_request(&self, method: Method) -> SipRequest {
        let mut dialog = self.dialog.lock();
        dialog.local_cseq += 1;
        SipRequest::new(method, dialog.target.clone())
            .with_call_id(dialog.call_id.clone())
            .with_from(dialog.local.clone(), Some(dialog.local_tag.clone()))
            .with_to(dialog.remote.clone(), dialog.remote_tag.clone())
            .with_cseq(dialog.local_cseq)
            .with_header("Event", self.handler.event_name())
    }

    /// Send a request inside the subscription dialog
    pub fn send_request(&self, request: &SipRequest) -> Result<()> {
        debug!(
            "Subscription {} sending {} (CSeq {})",
            self.id, request.method, request.cseq
        );
        Ok(self.ctx.sender.send_request(request)?)
    }

    /// Response to a request received on this dialog
    pub(crate) fn response_to(&self, request: &SipRequest, status: u16) -> SipResponse {
        let local_tag = self.dialog.lock().local_tag.clone();
        SipResponse::for_request(request, status).with_to_tag(Some(local_tag))
    }

    fn send_response(&self, response: &SipResponse) {
        if let Err(e) = self.ctx.sender.send_response(response) {
            warn!("Subscription {} failed to send {}: {}", self.id, response.status, e);
        }
    }

    /// Send a NOTIFY built from `data` with the negotiated body generator.
    ///
    /// A terminating NOTIFY moves the subscription to `Terminated`.
    pub fn notify(self: &Arc<Self>, data: Option<&BodyData>, terminate: bool) -> Result<()> {
        if self.role != SubscriptionRole::Notifier {
            return Err(PubsubError::InvalidState(
                "only notifier subscriptions send NOTIFY".to_string(),
            ));
        }
        if self.is_terminated() {
            return Err(PubsubError::Terminated(self.id.to_string()));
        }
        let body = match (data, self.generator.as_ref()) {
            (Some(data), Some(generator)) => {
                let content = self.ctx.bodies.generate_body_content(
                    generator.media_type(),
                    generator.subtype(),
                    data,
                )?;
                Some(SipBody::new(generator.content_type(), content))
            }
            _ => None,
        };
        let state = if terminate {
            "terminated".to_string()
        } else {
            format!("active;expires={}", self.remaining())
        };
        self.send_notify(state, body)?;
        if terminate {
            self.terminated(None);
        }
        Ok(())
    }

    fn send_notify(&self, subscription_state: String, body: Option<SipBody>) -> Result<()> {
        let mut request = self
            .next_request(Method::Notify)
            .with_header("Subscription-State", subscription_state);
        request.body = body;
        self.send_request(&request)
    }

    /// End the subscription from our side.
    ///
    /// A notifier sends a final NOTIFY carrying `reason`; a subscriber asks
    /// to unsubscribe and ends once the notifier confirms.
    pub fn terminate(self: &Arc<Self>, reason: Option<&str>) -> Result<()> {
        if self.is_terminated() {
            return Ok(());
        }
        match self.role {
            SubscriptionRole::Notifier => {
                let state = match reason {
                    Some(reason) => format!("terminated;reason={}", reason),
                    None => "terminated".to_string(),
                };
                self.send_notify(state, None)?;
                self.terminated(None);
                Ok(())
            }
            SubscriptionRole::Subscriber => self.send_subscribe(0),
        }
    }

    /// Send the initial SUBSCRIBE
    pub fn subscribe(self: &Arc<Self>) -> Result<()> {
        self.send_subscribe(self.expires())
    }

    /// Re-send SUBSCRIBE with the current expiry
    pub fn refresh(self: &Arc<Self>) -> Result<()> {
        self.send_subscribe(self.expires())
    }

    fn send_subscribe(self: &Arc<Self>, expires: u32) -> Result<()> {
        if self.role != SubscriptionRole::Subscriber {
            return Err(PubsubError::InvalidState(
                "only subscriber subscriptions send SUBSCRIBE".to_string(),
            ));
        }
        if self.is_terminated() {
            return Err(PubsubError::Terminated(self.id.to_string()));
        }
        let contact = format!("<{}>", self.dialog.lock().local.uri);
        let request = self
            .next_request(Method::Subscribe)
            .with_header("Accept", self.handler.accept().join(", "))
            .with_header("Expires", expires.to_string())
            .with_header("Contact", contact);
        *self.pending_subscribe.lock() = Some(request.cseq);
        self.send_request(&request)
    }

    // Lifecycle

    /// Mark active with a fresh lifetime and restart the timer
    pub(crate) fn activate(self: &Arc<Self>, expires: u32) {
        {
            let mut lifetime = self.lifetime.lock();
            lifetime.expires = expires;
            lifetime.refreshed_at = Instant::now();
        }
        {
            let mut state = self.state.lock();
            if *state == SubscriptionState::Terminated {
                return;
            }
            *state = SubscriptionState::Active;
        }
        self.start_timer(expires);
    }

    fn start_timer(self: &Arc<Self>, expires: u32) {
        let delay = match self.role {
            SubscriptionRole::Notifier => Duration::from_secs(u64::from(expires)),
            SubscriptionRole::Subscriber => refresh_delay(expires, self.ctx.config.refresh_margin),
        };
        let weak = Arc::downgrade(self);
        let timer = schedule(delay, async move {
            let Some(subscription) = weak.upgrade() else {
                return;
            };
            let queued = match subscription.role {
                SubscriptionRole::Notifier => subscription.push_task(|s| s.on_server_timeout()),
                SubscriptionRole::Subscriber => subscription.push_task(|s| s.on_client_refresh()),
            };
            if let Err(e) = queued {
                debug!("Subscription {}: {}", subscription.id, e);
            }
        });
        if let Some(old) = self.timer.lock().replace(timer) {
            old.cancel();
        }
    }

    fn on_server_timeout(self: &Arc<Self>) {
        if self.is_terminated() {
            return;
        }
        debug!("Subscription {} timed out", self.id);
        self.handler.subscription_timeout(self);
        if !self.is_terminated() {
            if let Err(e) = self.terminate(Some("timeout")) {
                warn!("Subscription {} could not send final NOTIFY: {}", self.id, e);
                self.terminated(None);
            }
        }
    }

    fn on_client_refresh(self: &Arc<Self>) {
        if self.is_terminated() {
            return;
        }
        debug!("Subscription {} refreshing", self.id);
        self.handler.refresh_subscription(self);
    }

    /// Enter `Terminated` and run the final callbacks once
    pub(crate) fn terminated(self: &Arc<Self>, trigger: Option<&SipRequest>) {
        {
            let mut state = self.state.lock();
            if *state == SubscriptionState::Terminated {
                return;
            }
            *state = SubscriptionState::Terminated;
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        self.ctx.subscriptions.remove(&self.key);
        info!(
            "Subscription {} for event {} terminated",
            self.id,
            self.handler.event_name()
        );
        self.handler.subscription_terminated(self, trigger);
        self.handler.subscription_shutdown(self);
    }

    // Received messages, run on the serializer

    /// Offer a new SUBSCRIBE to the handler and answer it.
    /// Returns false when the handler refused it.
    pub(crate) fn on_rx_new_subscribe(self: &Arc<Self>, request: &SipRequest) -> bool {
        match self.handler.new_subscribe(self, request) {
            NewSubscribe::Accepted => {
                let expires = self.expires();
                let contact = format!("<{}>", self.dialog.lock().local.uri);
                let response = self
                    .response_to(request, 200)
                    .with_header("Expires", expires.to_string())
                    .with_header("Contact", contact);
                self.send_response(&response);
                self.activate(expires);
                if let Err(e) = self.push_task(|s| s.handler.subscription_established(s)) {
                    warn!("Subscription {} could not queue initial NOTIFY: {}", self.id, e);
                }
                true
            }
            NewSubscribe::Rejected(status) => {
                let status = status.filter(|s| (300..700).contains(s)).unwrap_or(500);
                debug!(
                    "Handler for {} refused subscription {} with {}",
                    self.handler.event_name(),
                    self.id,
                    status
                );
                self.send_response(&self.response_to(request, status));
                *self.state.lock() = SubscriptionState::Terminated;
                self.ctx.subscriptions.remove(&self.key);
                false
            }
        }
    }

    /// In-dialog SUBSCRIBE on a subscription we serve
    pub(crate) fn on_rx_refresh(self: &Arc<Self>, request: &SipRequest) {
        if self.is_terminated() {
            self.send_response(&self.response_to(request, 481));
            return;
        }
        let config = &self.ctx.config;
        let expires = request_expires(request).unwrap_or(config.default_expires);
        if expires != 0 && expires < config.min_expiry {
            let response = self
                .response_to(request, 423)
                .with_header("Min-Expires", config.min_expiry.to_string());
            self.send_response(&response);
            return;
        }

        let mut data = ResponseData::default();
        self.handler.resubscribe(self, request, &mut data);
        let mut response = self
            .response_to(request, 200)
            .with_header("Expires", expires.to_string());
        if data.changed() {
            data.apply(&mut response);
        }
        self.send_response(&response);
        if !response.is_success() {
            return;
        }

        if expires == 0 {
            debug!("Subscription {} unsubscribed by peer", self.id);
            if let Err(e) = self.send_notify("terminated".to_string(), None) {
                warn!("Subscription {} could not send final NOTIFY: {}", self.id, e);
            }
            self.terminated(Some(request));
        } else {
            self.activate(expires);
        }
    }

    /// NOTIFY on a subscription we created
    pub(crate) fn on_rx_notify(self: &Arc<Self>, request: &SipRequest) {
        if self.is_terminated() {
            self.send_response(&self.response_to(request, 481));
            return;
        }
        {
            let mut dialog = self.dialog.lock();
            if dialog.remote_tag.is_none() {
                dialog.remote_tag = request.from_tag.clone();
            }
            if let Some(contact) = request.header("Contact") {
                dialog.target = NameAddr::parse(contact).uri;
            }
        }

        let mut data = ResponseData::default();
        self.handler.notify_request(self, request, &mut data);
        let mut response = self.response_to(request, 200);
        if data.changed() {
            data.apply(&mut response);
        }
        self.send_response(&response);

        let (state, expires) = parse_subscription_state(request.header("Subscription-State"));
        match state.as_str() {
            "terminated" => self.terminated(Some(request)),
            "pending" => {
                *self.state.lock() = SubscriptionState::Pending;
            }
            _ => {
                let expires = expires.unwrap_or_else(|| self.expires());
                if self.state() != SubscriptionState::Active || expires != self.expires() {
                    self.activate(expires);
                }
            }
        }
    }

    /// Response to a request we sent
    pub(crate) fn on_rx_response(self: &Arc<Self>, response: &SipResponse) {
        match (self.role, &response.method) {
            (SubscriptionRole::Notifier, Method::Notify) => {
                self.handler.notify_response(self, response);
                if matches!(response.status, 408 | 481) {
                    debug!(
                        "Subscription {} NOTIFY answered {}, ending",
                        self.id, response.status
                    );
                    self.terminated(None);
                }
            }
            (SubscriptionRole::Subscriber, Method::Subscribe) => {
                if response.is_provisional() {
                    return;
                }
                {
                    let mut pending = self.pending_subscribe.lock();
                    if *pending != Some(response.cseq) {
                        return;
                    }
                    *pending = None;
                }
                if !response.is_success() {
                    warn!(
                        "Subscription {} refused with {}",
                        self.id, response.status
                    );
                    self.terminated(None);
                    return;
                }
                {
                    let mut dialog = self.dialog.lock();
                    if dialog.remote_tag.is_none() {
                        dialog.remote_tag = response.to_tag.clone();
                    }
                }
                let granted = response
                    .header("Expires")
                    .and_then(|e| e.trim().parse::<u32>().ok())
                    .unwrap_or_else(|| self.expires());
                if granted > 0 {
                    self.activate(granted);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("event", &self.handler.event_name())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("Destroying subscription {}", self.id);
        if let Some(timer) = self.timer.get_mut().take() {
            timer.cancel();
        }
    }
}

/// Expires header of a request
pub(crate) fn request_expires(request: &SipRequest) -> Option<u32> {
    request.header("Expires")?.trim().parse().ok()
}

/// Lower-cased state and the `expires` parameter of a Subscription-State value
fn parse_subscription_state(value: Option<&str>) -> (String, Option<u32>) {
    let Some(value) = value else {
        return ("active".to_string(), None);
    };
    let mut parts = value.split(';');
    let state = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let expires = parts
        .filter_map(|p| p.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("expires"))
        .and_then(|(_, v)| v.trim().parse().ok());
    (state, expires)
}

/// When a subscriber refreshes a subscription granted for `expires` seconds
fn refresh_delay(expires: u32, margin: u32) -> Duration {
    if expires > margin.saturating_mul(2) {
        Duration::from_secs(u64::from(expires - margin))
    } else {
        Duration::from_millis(u64::from(expires) * 500)
    }
}
