//! PUBLISH handling
//!
//! Publish handlers are unique per event package. Each accepted PUBLISH
//! creates a [`Publication`] identified by an entity tag; refreshes,
//! modifications and removals name that tag in `SIP-If-Match` and every
//! successful response hands out a new one.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rvoip_infra_common::{schedule, Datastore, DatastoreContainer, ScheduledTask};
use rvoip_session_core::sip::{new_tag, HeaderAccess, SipBody, SipRequest, SipResponse, SipSender};
use tracing::{debug, error, warn};

use crate::errors::{PubsubError, Result};
use crate::handler::event_type;

static NEXT_ENTITY_TAG: AtomicU32 = AtomicU32::new(1);

fn next_entity_tag() -> u32 {
    NEXT_ENTITY_TAG.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Initialized,
    Active,
    Terminated,
}

/// What a received PUBLISH asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishType {
    Initial,
    Refresh,
    Modify,
    Remove,
    Unknown,
}

pub trait PublishHandler: Send + Sync {
    fn event_name(&self) -> &str;

    /// Whether `endpoint` may publish `resource`. A 2xx status allows it and
    /// is used for the response; anything else is sent back as the refusal.
    fn new_publication(&self, endpoint: &str, resource: &str) -> u16;

    /// Published state arrived or ended
    fn publication_state_change(
        &self,
        publication: &Arc<Publication>,
        body: Option<&SipBody>,
        state: PublishState,
    ) -> Result<()>;

    /// The publication was not refreshed in time
    fn publish_expire(&self, _publication: &Arc<Publication>) {}
}

impl fmt::Debug for dyn PublishHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishHandler")
            .field("event", &self.event_name())
            .finish()
    }
}

/// State published by one endpoint for one resource
pub struct Publication {
    entity_tag: AtomicU32,
    expires: AtomicU32,
    endpoint: String,
    resource: String,
    datastores: DatastoreContainer,
    timer: Mutex<Option<ScheduledTask>>,
}

impl Publication {
    fn new(endpoint: &str, resource: &str, expires: u32) -> Arc<Self> {
        Arc::new(Self {
            entity_tag: AtomicU32::new(next_entity_tag()),
            expires: AtomicU32::new(expires),
            endpoint: endpoint.to_string(),
            resource: resource.to_string(),
            datastores: DatastoreContainer::new(),
            timer: Mutex::new(None),
        })
    }

    pub fn entity_tag(&self) -> u32 {
        self.entity_tag.load(Ordering::SeqCst)
    }

    pub fn expires(&self) -> u32 {
        self.expires.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn datastores(&self) -> &DatastoreContainer {
        &self.datastores
    }

    pub fn add_datastore(&self, datastore: Arc<Datastore>) -> Result<()> {
        Ok(self.datastores.add(datastore)?)
    }

    pub fn get_datastore(&self, uid: &str) -> Option<Arc<Datastore>> {
        self.datastores.find(uid)
    }

    fn cancel_expiry(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("entity_tag", &self.entity_tag())
            .field("endpoint", &self.endpoint)
            .field("resource", &self.resource)
            .field("expires", &self.expires())
            .finish()
    }
}

/// A publish handler and its live publications keyed by entity tag
pub struct PublishEntry {
    handler: Arc<dyn PublishHandler>,
    publications: DashMap<u32, Arc<Publication>>,
}

impl PublishEntry {
    pub fn handler(&self) -> &Arc<dyn PublishHandler> {
        &self.handler
    }

    pub fn publication(&self, entity_tag: u32) -> Option<Arc<Publication>> {
        self.publications.get(&entity_tag).map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.publications.len()
    }

    fn schedule_expiry(self: &Arc<Self>, publication: &Arc<Publication>, expires: u32) {
        let entry = Arc::downgrade(self);
        let weak = Arc::downgrade(publication);
        let tag = publication.entity_tag();
        let timer = schedule(Duration::from_secs(u64::from(expires)), async move {
            expire(entry, weak, tag);
        });
        if let Some(old) = publication.timer.lock().replace(timer) {
            old.cancel();
        }
    }
}

fn expire(entry: Weak<PublishEntry>, publication: Weak<Publication>, tag: u32) {
    let (Some(entry), Some(publication)) = (entry.upgrade(), publication.upgrade()) else {
        return;
    };
    if entry.publications.remove(&tag).is_none() {
        return;
    }
    debug!(
        "Publication {} from {} for {} expired",
        tag, publication.endpoint, publication.resource
    );
    entry.handler.publish_expire(&publication);
}

/// Classify a PUBLISH by its `SIP-If-Match` tag, body and expiry
pub fn publish_type(request: &SipRequest, default_expires: u32) -> (PublishType, u32, Option<u32>) {
    let etag_header = request.header("SIP-If-Match");
    let etag = match etag_header {
        Some(value) => match value.trim().parse::<u32>() {
            Ok(tag) => Some(tag),
            Err(_) => return (PublishType::Unknown, default_expires, None),
        },
        None => None,
    };
    let expires = request
        .header("Expires")
        .and_then(|e| e.trim().parse().ok())
        .unwrap_or(default_expires);
    let has_body = request.body.is_some();

    let kind = match (expires, etag.is_some(), has_body) {
        (0, _, _) => PublishType::Remove,
        (_, false, true) => PublishType::Initial,
        (_, true, false) => PublishType::Refresh,
        (_, true, true) => PublishType::Modify,
        _ => PublishType::Unknown,
    };
    (kind, expires, etag)
}

#[derive(Default)]
pub struct PublishRegistry {
    entries: RwLock<Vec<Arc<PublishEntry>>>,
}

impl PublishRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn PublishHandler>) -> Result<()> {
        let event = handler.event_name().to_string();
        if event.is_empty() {
            error!("No event package specified for publish handler. Cannot register");
            return Err(PubsubError::MissingEventName);
        }
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.handler.event_name() == event) {
            error!("A publish handler for event {} is already registered", event);
            return Err(PubsubError::DuplicatePublishHandler(event));
        }
        debug!("Registered publish handler for event {}", event);
        entries.push(Arc::new(PublishEntry {
            handler,
            publications: DashMap::new(),
        }));
        Ok(())
    }

    /// Remove the handler for `event`, dropping its publications
    pub fn unregister(&self, event: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| {
            let keep = e.handler.event_name() != event;
            if !keep {
                for publication in e.publications.iter() {
                    publication.value().cancel_expiry();
                }
                e.publications.clear();
            }
            keep
        });
        entries.len() != before
    }

    pub fn find(&self, event: &str) -> Option<Arc<PublishEntry>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.handler.event_name() == event)
            .cloned()
    }

    /// Handle a received PUBLISH, sending every response itself
    pub(crate) fn on_rx_publish(
        &self,
        sender: &Arc<dyn SipSender>,
        default_expires: u32,
        endpoint: &str,
        request: &SipRequest,
    ) {
        let respond = |response: SipResponse| {
            if let Err(e) = sender.send_response(&response) {
                warn!("Failed to answer PUBLISH with {}: {}", response.status, e);
            }
        };
        let reply = |status: u16| {
            respond(SipResponse::for_request(request, status).with_to_tag(Some(new_tag())));
        };

        let Some(event) = request.header("Event").map(event_type) else {
            warn!("Incoming PUBLISH request from {} with no Event header", endpoint);
            reply(489);
            return;
        };
        let Some(entry) = self.find(event) else {
            warn!("No registered publish handler for event {} from {}", event, endpoint);
            reply(489);
            return;
        };

        let (kind, mut expires, etag) = publish_type(request, default_expires);

        let mut publication = None;
        if matches!(kind, PublishType::Refresh | PublishType::Modify | PublishType::Remove) {
            let Some((_, existing)) = etag.and_then(|tag| entry.publications.remove(&tag)) else {
                debug!("PUBLISH from {} names unknown entity tag {:?}", endpoint, etag);
                reply(412);
                return;
            };
            existing.entity_tag.store(next_entity_tag(), Ordering::SeqCst);
            existing.expires.store(expires, Ordering::SeqCst);
            publication = Some(existing);
        }

        let status = match kind {
            PublishType::Initial => {
                match self.publish_initial(&entry, endpoint, request, expires) {
                    Ok((created, status)) => {
                        publication = Some(created);
                        status
                    }
                    Err(status) => {
                        reply(status);
                        return;
                    }
                }
            }
            PublishType::Refresh | PublishType::Modify => {
                if let Some(existing) = &publication {
                    if let Err(e) = entry.handler.publication_state_change(
                        existing,
                        request.body.as_ref(),
                        PublishState::Active,
                    ) {
                        warn!("Publication {} update failed, ending it: {}", existing.entity_tag(), e);
                        expires = 0;
                        existing.expires.store(0, Ordering::SeqCst);
                    }
                }
                200
            }
            PublishType::Remove => {
                if let Some(existing) = &publication {
                    if let Err(e) = entry.handler.publication_state_change(
                        existing,
                        request.body.as_ref(),
                        PublishState::Terminated,
                    ) {
                        debug!("Publication {} removal: {}", existing.entity_tag(), e);
                    }
                }
                200
            }
            PublishType::Unknown => {
                reply(400);
                return;
            }
        };

        let Some(publication) = publication else {
            return;
        };
        if expires > 0 {
            entry
                .publications
                .insert(publication.entity_tag(), publication.clone());
            entry.schedule_expiry(&publication, expires);
        } else {
            publication.cancel_expiry();
        }

        let mut response = SipResponse::for_request(request, status).with_to_tag(Some(new_tag()));
        if response.is_success() {
            response.add_header("SIP-ETag", publication.entity_tag().to_string());
            response.add_header("Expires", publication.expires().to_string());
        }
        respond(response);
    }

    /// New publication; `Err` carries the refusal status
    fn publish_initial(
        &self,
        entry: &Arc<PublishEntry>,
        endpoint: &str,
        request: &SipRequest,
        expires: u32,
    ) -> std::result::Result<(Arc<Publication>, u16), u16> {
        let scheme = request.uri_scheme();
        if !matches!(scheme.as_deref(), Some("sip") | Some("sips")) {
            warn!("Request URI '{}' is not a sip: or sips: URI", request.uri);
            return Err(416);
        }
        let resource = request.uri_user().unwrap_or_default().to_string();

        let status = entry.handler.new_publication(endpoint, &resource);
        if !(200..300).contains(&status) {
            debug!("Publication of {} by {} refused with {}", resource, endpoint, status);
            return Err(status);
        }

        let publication = Publication::new(endpoint, &resource, expires);
        if let Err(e) = entry.handler.publication_state_change(
            &publication,
            request.body.as_ref(),
            PublishState::Initialized,
        ) {
            warn!("Publication of {} by {} failed: {}", resource, endpoint, e);
            return Err(500);
        }
        Ok((publication, status))
    }
}
