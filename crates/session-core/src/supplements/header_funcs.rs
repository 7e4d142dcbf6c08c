//! Header functions
//!
//! Lets application code read the headers of the INVITE that created a
//! session and stage extra headers for the outgoing initial INVITE, the way
//! the `PJSIP_HEADER(action,name[,number])` dialplan function does. All
//! access runs on the session serializer.

use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_infra_common::{Datastore, DatastoreType};
use tracing::{debug, error};

use crate::dialog::InviteState;
use crate::errors::{Result, SessionError};
use crate::session::Session;
use crate::sip::{HeaderAccess, SipHeader, SipRequest};
use crate::supplement::{priority, RequestDisposition, SessionSupplement};

pub const HEADER_DATASTORE: &str = "header_datastore";

struct HeaderDatastoreType;

impl DatastoreType for HeaderDatastoreType {
    fn name(&self) -> &str {
        HEADER_DATASTORE
    }
}

/// Headers kept on the session
#[derive(Debug, Default)]
pub struct HeaderList {
    /// Copied from received INVITEs
    pub incoming: Vec<SipHeader>,
    /// Added by the application, sent on the next initial INVITE
    pub outgoing: Vec<SipHeader>,
}

impl HeaderList {
    /// The `number`th (1-based) header named `name`, received ones first
    pub fn find(&self, name: &str, number: usize) -> Option<&SipHeader> {
        self.incoming
            .iter()
            .chain(self.outgoing.iter())
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .nth(number.max(1) - 1)
    }

    pub fn update(&mut self, name: &str, number: usize, value: &str) -> bool {
        match self
            .outgoing
            .iter_mut()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .nth(number.max(1) - 1)
        {
            Some(header) => {
                header.value = value.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove added headers named `pattern`; a trailing `*` matches a prefix
    pub fn remove(&mut self, pattern: &str) -> usize {
        let before = self.outgoing.len();
        match pattern.strip_suffix('*') {
            Some(prefix) => self.outgoing.retain(|h| {
                !h.name
                    .get(..prefix.len())
                    .is_some_and(|p| p.eq_ignore_ascii_case(prefix))
            }),
            None => self.outgoing.retain(|h| !h.name.eq_ignore_ascii_case(pattern)),
        }
        before - self.outgoing.len()
    }
}

type SharedHeaders = Arc<Mutex<HeaderList>>;

fn find_list(session: &Session) -> Option<SharedHeaders> {
    session
        .get_datastore(HEADER_DATASTORE)?
        .data::<Mutex<HeaderList>>()
}

fn ensure_list(session: &Session) -> Result<SharedHeaders> {
    if let Some(list) = find_list(session) {
        return Ok(list);
    }
    let list: SharedHeaders = Arc::new(Mutex::new(HeaderList::default()));
    let datastore = Datastore::alloc(
        Arc::new(HeaderDatastoreType),
        Some(HEADER_DATASTORE),
        Some(list.clone()),
    );
    session.add_datastore(datastore)?;
    Ok(list)
}

/// A `PJSIP_HEADER` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    Read { name: String, number: usize },
    Add { name: String, value: String },
    Update { name: String, number: usize, value: String },
    Remove { name: String },
}

impl HeaderAction {
    /// Parse `action,name[,number]` plus the value written, if any
    pub fn parse(args: &str, value: Option<&str>) -> Result<Self> {
        let mut parts = args.split(',').map(str::trim);
        let action = parts.next().filter(|a| !a.is_empty());
        let name = parts.next().filter(|n| !n.is_empty());
        let number = parts
            .next()
            .and_then(|n| n.parse::<i64>().ok())
            .map_or(1, |n| n.max(1) as usize);
        let (Some(action), Some(name)) = (action, name) else {
            return Err(SessionError::other("PJSIP_HEADER requires an action and a header name"));
        };
        let name = name.to_string();
        let value = || {
            value
                .map(str::to_string)
                .ok_or_else(|| SessionError::other(format!("PJSIP_HEADER {} requires a value", action)))
        };
        match action.to_ascii_lowercase().as_str() {
            "read" => Ok(HeaderAction::Read { name, number }),
            "add" => Ok(HeaderAction::Add { name, value: value()? }),
            "update" => Ok(HeaderAction::Update {
                name,
                number,
                value: value()?,
            }),
            "remove" => Ok(HeaderAction::Remove { name }),
            other => Err(SessionError::other(format!(
                "unknown PJSIP_HEADER action '{}'",
                other
            ))),
        }
    }

    /// Run against the session's header list. Must run on the serializer.
    fn apply(self, session: &Session) -> Result<String> {
        match self {
            HeaderAction::Read { name, number } => {
                let list = find_list(session)
                    .ok_or_else(|| SessionError::other("no headers stored on the session"))?;
                let list = list.lock();
                list.find(&name, number)
                    .map(|h| h.value.trim().to_string())
                    .ok_or(SessionError::HeaderNotFound(name))
            }
            HeaderAction::Add { name, value } => {
                debug!("Session {}: adding header {}: {}", session.id(), name, value);
                ensure_list(session)?
                    .lock()
                    .outgoing
                    .push(SipHeader::new(name, value));
                Ok(String::new())
            }
            HeaderAction::Update { name, number, value } => {
                let list = find_list(session)
                    .ok_or_else(|| SessionError::other("no headers were added to the session"))?;
                if list.lock().update(&name, number, &value) {
                    Ok(String::new())
                } else {
                    Err(SessionError::HeaderNotFound(name))
                }
            }
            HeaderAction::Remove { name } => {
                let list = find_list(session)
                    .ok_or_else(|| SessionError::other("no headers were added to the session"))?;
                let removed = list.lock().remove(&name);
                Ok(removed.to_string())
            }
        }
    }
}

/// Evaluate `PJSIP_HEADER(args)`, writing `value` for add and update.
///
/// Read returns the header value, remove the number of headers removed.
pub async fn pjsip_header(session: &Arc<Session>, args: &str, value: Option<&str>) -> Result<String> {
    let action = HeaderAction::parse(args, value)?;
    session
        .push_task_synchronous(move |s| action.apply(s))
        .await?
}

/// Stores received INVITE headers and adds staged ones to the initial INVITE
#[derive(Debug, Default)]
pub struct HeaderFuncsSupplement;

impl SessionSupplement for HeaderFuncsSupplement {
    fn name(&self) -> &str {
        "header-funcs"
    }

    fn method(&self) -> Option<&str> {
        Some("INVITE")
    }

    fn priority(&self) -> i32 {
        priority::CHANNEL - 1000
    }

    fn incoming_request(&self, session: &Arc<Session>, request: &SipRequest) -> RequestDisposition {
        match ensure_list(session) {
            Ok(list) => list.lock().incoming.extend(request.headers.iter().cloned()),
            Err(e) => error!("Session {}: unable to store headers: {}", session.id(), e),
        }
        RequestDisposition::Continue
    }

    fn outgoing_request(&self, session: &Arc<Session>, request: &mut SipRequest) {
        if matches!(
            session.invite_state(),
            InviteState::Confirmed | InviteState::Disconnected
        ) {
            return;
        }
        let Some(list) = find_list(session) else {
            return;
        };
        for header in list.lock().outgoing.iter() {
            request.add_header(header.name.clone(), header.value.clone());
        }
        session.remove_datastore(HEADER_DATASTORE);
    }
}
