//! ICE-Lite connectivity.
//!
//! The agent never sends checks. It answers STUN binding requests from the
//! controlling peer, learns the tuples those requests arrive on, and keeps
//! one of them selected as the destination of everything this transport
//! sends.

pub mod parameters;
pub mod state;


pub use parameters::IceParameters;
pub use state::IceState;

use bytes::BytesMut;
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportMessage};
use std::collections::VecDeque;
use std::time::Instant;
use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::*;
use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;
use stun::xoraddr::*;

/// Notification of the [`IceLiteAgent`] to the transport pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IceEvent {
    StateChange(IceState),
    SelectedTupleChange(TransportContext),
}

/// Credentials that authenticated a binding request.
enum Authenticated {
    Current,
    Previous,
}

pub(crate) struct IceLiteAgent {
    username_fragment: String,
    password: String,
    /// Credentials before the last restart, accepted until the peer uses the
    /// new ones.
    old_username_fragment: Option<String>,
    old_password: Option<String>,
    state: IceState,
    tuples: Vec<TransportContext>,
    selected_tuple: Option<TransportContext>,
    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<IceEvent>,
}

impl IceLiteAgent {
    pub(crate) fn new(username_fragment: String, password: String) -> Self {
        Self {
            username_fragment,
            password,
            old_username_fragment: None,
            old_password: None,
            state: IceState::New,
            tuples: vec![],
            selected_tuple: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub(crate) fn parameters(&self) -> IceParameters {
        IceParameters {
            username_fragment: self.username_fragment.clone(),
            password: self.password.clone(),
            ice_lite: true,
        }
    }

    /// Replaces the local credentials. Requests signed with the previous
    /// ones are still answered until one arrives with the new ones.
    pub(crate) fn restart(&mut self, username_fragment: String, password: String) {
        debug!("ICE restart");
        self.old_username_fragment = Some(std::mem::replace(
            &mut self.username_fragment,
            username_fragment,
        ));
        self.old_password = Some(std::mem::replace(&mut self.password, password));
    }

    pub(crate) fn state(&self) -> IceState {
        self.state
    }

    pub(crate) fn selected_tuple(&self) -> Option<TransportContext> {
        self.selected_tuple
    }

    pub(crate) fn is_valid_tuple(&self, transport: &TransportContext) -> bool {
        self.tuples.iter().any(|tuple| tuple.same_tuple(transport))
    }

    pub(crate) fn handle_stun(
        &mut self,
        now: Instant,
        transport: TransportContext,
        data: &[u8],
    ) -> Result<()> {
        let mut m = Message {
            raw: vec![],
            ..Message::default()
        };
        m.raw.extend_from_slice(data);
        m.decode().map_err(|e| Error::Stun(e.to_string()))?;

        if m.typ.method != METHOD_BINDING {
            if m.typ.class == CLASS_REQUEST {
                warn!("unknown method {} in STUN request => 400", m.typ.method);
                self.send_error(now, transport, &m, CODE_BAD_REQUEST)?;
            } else {
                debug!("ignoring STUN indication or response with unknown method");
            }
            return Ok(());
        }

        if !m.contains(ATTR_FINGERPRINT) && m.typ.class != CLASS_INDICATION {
            if m.typ.class == CLASS_REQUEST {
                warn!("STUN binding request without FINGERPRINT => 400");
                self.send_error(now, transport, &m, CODE_BAD_REQUEST)?;
            } else {
                debug!("ignoring STUN binding response without FINGERPRINT");
            }
            return Ok(());
        }

        if m.typ.class == CLASS_REQUEST {
            self.handle_binding_request(now, transport, m)
        } else {
            trace!("STUN binding {} processed", m.typ.class);
            Ok(())
        }
    }

    fn handle_binding_request(
        &mut self,
        now: Instant,
        transport: TransportContext,
        mut m: Message,
    ) -> Result<()> {
        let username = TextAttribute::get_from_as(&m, ATTR_USERNAME)
            .map(|username| username.to_string())
            .unwrap_or_default();
        if username.is_empty() || !m.contains(ATTR_MESSAGE_INTEGRITY) || !m.contains(ATTR_PRIORITY)
        {
            warn!("missing required attributes in STUN binding request => 400");
            return self.send_error(now, transport, &m, CODE_BAD_REQUEST);
        }

        let password = match self.authenticate(&mut m, &username) {
            Some(Authenticated::Current) => {
                if self.old_password.take().is_some() {
                    self.old_username_fragment = None;
                    debug!("new ICE credentials applied");
                }
                self.password.clone()
            }
            Some(Authenticated::Previous) => {
                debug!("using previous ICE credentials");
                self.old_password.clone().unwrap_or_default()
            }
            None => {
                warn!("wrong authentication in STUN binding request => 401");
                return self.send_error(now, transport, &m, CODE_UNAUTHORIZED);
            }
        };

        // the remote peer must be the controlling one
        if m.contains(ATTR_ICE_CONTROLLED) {
            warn!("peer indicates ICE-CONTROLLED in STUN binding request => 487");
            return self.send_error(now, transport, &m, CODE_ROLE_CONFLICT);
        }

        let mut out = Message::new();
        out.build(&[
            Box::new(m.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: transport.peer_addr.ip(),
                port: transport.peer_addr.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(password)),
            Box::new(FINGERPRINT),
        ])
        .map_err(|e| Error::Stun(e.to_string()))?;
        self.send(now, transport, &out);

        self.handle_tuple(transport, m.contains(ATTR_USE_CANDIDATE));

        Ok(())
    }

    /// `username` is `local ufrag:remote ufrag`, the integrity is keyed by
    /// the local password.
    fn authenticate(&self, m: &mut Message, username: &str) -> Option<Authenticated> {
        let local_ufrag = username.split_once(':').map(|(local, _)| local)?;

        if local_ufrag == self.username_fragment
            && MessageIntegrity::new_short_term_integrity(self.password.clone())
                .check(m)
                .is_ok()
        {
            return Some(Authenticated::Current);
        }

        if let (Some(old_ufrag), Some(old_password)) =
            (&self.old_username_fragment, &self.old_password)
        {
            if local_ufrag == old_ufrag
                && MessageIntegrity::new_short_term_integrity(old_password.clone())
                    .check(m)
                    .is_ok()
            {
                return Some(Authenticated::Previous);
            }
        }

        None
    }

    fn handle_tuple(&mut self, transport: TransportContext, has_use_candidate: bool) {
        match self.state {
            IceState::New | IceState::Disconnected => {
                self.add_tuple(transport);
                self.set_selected_tuple(transport);
                if has_use_candidate {
                    self.state_change(IceState::Completed);
                } else {
                    self.state_change(IceState::Connected);
                }
            }
            IceState::Connected | IceState::Completed => {
                if !self.is_valid_tuple(&transport) {
                    self.add_tuple(transport);
                }
                if has_use_candidate {
                    self.set_selected_tuple(transport);
                    self.state_change(IceState::Completed);
                }
            }
        }
    }

    /// Makes a known tuple the selected one, e.g. because DTLS data arrived
    /// on it.
    pub(crate) fn force_selected_tuple(&mut self, transport: &TransportContext) -> Result<()> {
        if self.selected_tuple.is_none() {
            return Err(Error::ErrIceNoSelectedTuple);
        }
        let tuple = self
            .tuples
            .iter()
            .find(|tuple| tuple.same_tuple(transport))
            .copied()
            .ok_or(Error::ErrIceTupleNotFound)?;

        self.set_selected_tuple(tuple);
        Ok(())
    }

    /// Forgets a tuple, e.g. a closed TCP connection. Losing the last tuple
    /// disconnects.
    pub(crate) fn remove_tuple(&mut self, transport: &TransportContext) {
        let Some(index) = self
            .tuples
            .iter()
            .position(|tuple| tuple.same_tuple(transport))
        else {
            return;
        };
        let removed = self.tuples.remove(index);

        if self
            .selected_tuple
            .is_some_and(|selected| selected.same_tuple(&removed))
        {
            self.selected_tuple = None;
            if let Some(first) = self.tuples.first().copied() {
                self.set_selected_tuple(first);
            } else {
                self.state_change(IceState::Disconnected);
            }
        }
    }

    pub(crate) fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }

    pub(crate) fn poll_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    pub(crate) fn close(&mut self) {
        self.tuples.clear();
        self.selected_tuple = None;
        self.transmits.clear();
    }

    fn add_tuple(&mut self, transport: TransportContext) {
        debug!("new ICE tuple {}", shared::FiveTuple::from(&transport));
        self.tuples.push(transport);
    }

    fn set_selected_tuple(&mut self, transport: TransportContext) {
        if self
            .selected_tuple
            .is_some_and(|selected| selected.same_tuple(&transport))
        {
            return;
        }
        self.selected_tuple = Some(transport);
        self.events
            .push_back(IceEvent::SelectedTupleChange(transport));
    }

    fn state_change(&mut self, state: IceState) {
        if self.state == state {
            return;
        }
        debug!("ICE state {} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(IceEvent::StateChange(state));
    }

    fn send_error(
        &mut self,
        now: Instant,
        transport: TransportContext,
        request: &Message,
        code: ErrorCode,
    ) -> Result<()> {
        let mut out = Message::new();
        out.build(&[
            Box::new(request.clone()),
            Box::new(MessageType::new(request.typ.method, CLASS_ERROR_RESPONSE)),
            Box::new(ErrorCodeAttribute {
                code,
                reason: vec![],
            }),
            Box::new(FINGERPRINT),
        ])
        .map_err(|e| Error::Stun(e.to_string()))?;
        self.send(now, transport, &out);
        Ok(())
    }

    fn send(&mut self, now: Instant, transport: TransportContext, m: &Message) {
        self.transmits.push_back(TransportMessage {
            now,
            transport,
            message: BytesMut::from(&m.raw[..]),
        });
    }
}
