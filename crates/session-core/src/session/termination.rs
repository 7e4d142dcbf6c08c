//! Session termination and teardown

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rvoip_infra_common::{schedule, ScheduledTask};
use tracing::{debug, info, warn};

use crate::dialog::{DialogRole, InviteState};
use crate::errors::{Result, SessionError};
use crate::media::SessionMedia;
use crate::session::{DelayedMethod, ReinviteState, Session, SessionEvent};
use crate::sip::Method;

/// How long a deferred termination may wait before it happens anyway
pub const DEFER_TERMINATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub(crate) struct TerminationState {
    /// Termination requests are being held back
    defer_terminate: bool,
    /// Someone asked to terminate while it was deferred
    terminate_while_deferred: bool,
    /// Ending the session is being held back
    defer_end: bool,
    /// The dialog went away while ending was deferred
    ended_while_deferred: bool,
    timer: Option<ScheduledTask>,
}

impl Session {
    /// End the dialog with `code`; 0 picks 603.
    ///
    /// Depending on where the dialog is this sends a final response, a
    /// CANCEL or a BYE. With a re-INVITE in flight on a confirmed dialog the
    /// BYE is delayed until the transaction finishes.
    pub fn terminate(self: &Arc<Self>, code: u16) -> Result<()> {
        let code = if code == 0 { 603 } else { code };
        {
            let mut termination = self.termination.lock();
            if termination.defer_terminate {
                debug!("Session {}: termination deferred", self.id);
                termination.terminate_while_deferred = true;
                return Ok(());
            }
        }

        let (state, role, answered, has_tsx) = {
            let inv = self.inv.lock();
            (inv.state, inv.role, inv.answered, inv.invite_tsx.is_some())
        };
        match state {
            InviteState::Disconnected => return Ok(()),
            InviteState::Null if !has_tsx => {
                info!("Session {}: terminating before any request was sent", self.id);
                self.end();
                return Ok(());
            }
            InviteState::Confirmed if has_tsx => {
                self.delay_request(DelayedMethod::Bye, None);
                return Ok(());
            }
            _ => {}
        }

        self.delayed.lock().clear();
        info!("Session {}: terminating with {}", self.id, code);
        match (role, state) {
            (DialogRole::Uas, InviteState::Incoming | InviteState::Early) if !answered => {
                self.answer(code)
            }
            (DialogRole::Uac, InviteState::Calling | InviteState::Early) => self.send_cancel(),
            _ => self.send_bye(),
        }
    }

    fn send_cancel(self: &Arc<Self>) -> Result<()> {
        let request = self.inv.lock().create_request(Method::Cancel);
        self.send_request(request)
    }

    pub(crate) fn send_bye(self: &Arc<Self>) -> Result<()> {
        let request = self.inv.lock().create_request(Method::Bye);
        self.send_request(request)
    }

    /// Hold back termination until [`Session::defer_termination_cancel`] or a timeout
    pub fn defer_termination(self: &Arc<Self>) -> Result<()> {
        let mut termination = self.termination.lock();
        if termination.defer_terminate {
            return Err(SessionError::AlreadyDeferred);
        }
        termination.defer_terminate = true;
        termination.defer_end = true;
        termination.ended_while_deferred = false;

        let weak = self.weak_self.clone();
        let timer = schedule(DEFER_TERMINATION_TIMEOUT, async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let pushed = session.push_task(|s| {
                let expired = std::mem::take(&mut s.termination.lock().defer_terminate);
                if expired {
                    warn!("Session {}: deferred termination timed out", s.id);
                    if let Err(e) = s.terminate(0) {
                        warn!("Session {}: termination failed: {}", s.id, e);
                    }
                }
            });
            if let Err(e) = pushed {
                debug!("Session {}: {}", session.id(), e);
            }
        });
        if let Some(previous) = termination.timer.replace(timer) {
            previous.cancel();
        }
        debug!("Session {}: termination deferred", self.id);
        Ok(())
    }

    /// Stop deferring termination, completing one requested meanwhile
    pub fn defer_termination_cancel(self: &Arc<Self>) {
        let terminate = {
            let mut termination = self.termination.lock();
            if !termination.defer_terminate {
                return;
            }
            termination.defer_terminate = false;
            if let Some(timer) = termination.timer.take() {
                timer.cancel();
            }
            std::mem::take(&mut termination.terminate_while_deferred)
        };
        if terminate {
            if let Err(e) = self.terminate(0) {
                warn!("Session {}: termination failed: {}", self.id, e);
            }
        }
    }

    /// Finish ending the session if the remote hung up while ending was deferred
    pub fn end_if_deferred(self: &Arc<Self>) {
        let ended = {
            let mut termination = self.termination.lock();
            if !termination.defer_end {
                return;
            }
            termination.defer_end = false;
            std::mem::take(&mut termination.ended_while_deferred)
        };
        if ended {
            debug!("Session {}: ending after deferral", self.id);
            self.session_end();
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// The dialog is gone. Teardown waits while ending is deferred.
    pub(crate) fn end(self: &Arc<Self>) {
        self.set_invite_state(InviteState::Disconnected);
        {
            let mut termination = self.termination.lock();
            if termination.defer_end {
                debug!("Session {}: end deferred", self.id);
                termination.ended_while_deferred = true;
                return;
            }
        }
        self.session_end();
    }

    fn session_end(self: &Arc<Self>) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Ending session {}", self.id);

        if let Some(timer) = self.termination.lock().timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.collision_timer.lock().take() {
            timer.cancel();
        }
        *self.reinvite.lock() = ReinviteState::Idle;
        self.delayed.lock().clear();
        self.response_callbacks.lock().clear();

        for supplement in &self.supplements {
            supplement.session_end(self);
        }

        let mut medias: Vec<Arc<SessionMedia>> = Vec::new();
        let active = self.active_media();
        let pending = self.take_pending_media();
        for media in active.sessions.iter().chain(pending.sessions.iter()) {
            if !medias.iter().any(|m| Arc::ptr_eq(m, media)) {
                medias.push(media.clone());
            }
        }
        for media in &medias {
            if let Some(handler) = media.handler() {
                handler.stream_stop(media);
                handler.stream_destroy(media);
            }
        }

        self.ctx.registry.remove(&self.id);
        self.emit(SessionEvent::Ended {
            session_id: self.id.clone(),
        });
    }
}
