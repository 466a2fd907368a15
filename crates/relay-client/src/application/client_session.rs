//! ClientSession: the phone side of one relay session, without sockets.
//!
//! The session remembers three things across reconnects:
//!
//! - the pairing code and client id, until the host answers `Paired`;
//! - the session id, afterwards;
//! - the [`Outbox`] of prompts the host has not acknowledged yet.
//!
//! The connection driver feeds it every frame it reads and sends whatever
//! frames it returns.  Keeping this logic free of I/O makes the retransmit
//! rules easy to test on their own.
//!
//! # Retransmission (for beginners)
//!
//! ```text
//!   send 1,2,3 ──► host acks 2 ──► socket drops ──► reconnect, Resume(acked=2)
//!                                                     │
//!                 host: Resumed(delivered=3) ◄────────┘
//!                                                     │
//!   outbox now empty, nothing resent ◄────────────────┘
//! ```
//!
//! Prompt 3 reached the host but its ack was lost with the socket.  The host
//! reports what it actually delivered, so only prompts above that number are
//! sent again.

use relay_core::{ErrorCode, Frame, FrameBody, Outbox, OutboxError, SessionId, SessionStatus};
use thiserror::Error;
use tracing::debug;

/// Who this phone is, as announced in `Pair`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Stable per install; lets the host recognise a repeated `Pair`.
    pub client_id: String,
    pub name: Option<String>,
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The host accepted the pairing code.
    Paired { session_id: SessionId },
    /// The host accepted the resume; `delivered` is its high-water mark.
    Resumed { session_id: SessionId, delivered: u64 },
    /// Every prompt up to `seq` reached the consumer.
    Acked { seq: u64 },
    /// The host reported a status change.
    Status(SessionStatus),
    /// The host sent a prompt-like message to the phone.
    HostMessage { seq: u64, text: String },
    /// The socket closed; the client will try to resume.
    Disconnected { reason: String },
    /// The session is over and the client stopped.
    Ended { reason: String },
}

/// Errors that end the session for good.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The host refused pairing or resume, or closed with an error.
    #[error("host rejected the session ({code:?}): {description}")]
    Rejected { code: ErrorCode, description: String },

    /// The host sent a frame that makes no sense at this point.
    #[error("unexpected {0} from host")]
    Unexpected(&'static str),
}

/// What to do after a frame from the host.
#[derive(Debug, Default, PartialEq)]
pub struct Reaction {
    pub events: Vec<ClientEvent>,
    pub send: Vec<Frame>,
}

/// Phone-side session state.
#[derive(Debug)]
pub struct ClientSession {
    identity: ClientIdentity,
    code: String,
    session_id: Option<SessionId>,
    outbox: Outbox,
    /// `true` between `Paired`/`Resumed` and the next transport loss.
    established: bool,
}

impl ClientSession {
    pub fn new(code: impl Into<String>, identity: ClientIdentity, outbox_capacity: usize) -> Self {
        Self {
            identity,
            code: code.into(),
            session_id: None,
            outbox: Outbox::new(outbox_capacity),
            established: false,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Highest prompt the host acknowledged.
    pub fn acked_through(&self) -> u64 {
        self.outbox.acked_through()
    }

    /// Prompts still waiting for an ack.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// The first frame for a new connection: `Resume` once paired, `Pair`
    /// (carrying the client id, so a lost `Paired` can be retried) before.
    pub fn handshake(&self) -> Frame {
        match self.session_id {
            Some(id) => Frame::resume(id, self.outbox.acked_through()),
            None => Frame::pair(self.code.clone(), self.identity.name.clone())
                .with_client_id(self.identity.client_id.clone()),
        }
    }

    /// Numbers `text` and keeps it until acknowledged.
    ///
    /// Returns the sequence number and, when a connection is established,
    /// the frame to send now.  Otherwise the prompt goes out after the next
    /// `Paired` or `Resumed`.
    ///
    /// # Errors
    ///
    /// [`OutboxError::Full`] when too many prompts are unacknowledged.
    pub fn queue_prompt(
        &mut self,
        text: impl Into<String>,
    ) -> Result<(u64, Option<Frame>), OutboxError> {
        let text = text.into();
        let seq = self.outbox.push(text.clone())?;
        let frame = self.established.then(|| Frame::prompt(seq, text));
        Ok((seq, frame))
    }

    /// Our heartbeat, carrying the highest seq handed out.
    pub fn heartbeat(&self) -> Frame {
        Frame::heartbeat(self.outbox.last_sent())
    }

    /// The socket went away; prompts queue until the next handshake.
    pub fn transport_lost(&mut self) {
        self.established = false;
    }

    /// Applies one frame from the host.
    ///
    /// # Errors
    ///
    /// [`SessionError`] when the host ended the session or broke the
    /// protocol; the caller should stop.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Reaction, SessionError> {
        let mut reaction = Reaction::default();

        match frame.body {
            FrameBody::Paired { .. } => {
                let session_id = frame
                    .session_id
                    .ok_or(SessionError::Unexpected("Paired without sessionId"))?;
                self.session_id = Some(session_id);
                self.established = true;
                reaction.events.push(ClientEvent::Paired { session_id });
                reaction.send = self.retransmit();
            }
            FrameBody::Resumed => {
                let session_id = self
                    .session_id
                    .ok_or(SessionError::Unexpected("Resumed before pairing"))?;
                self.established = true;
                self.apply_ack(frame.seq, &mut reaction);
                reaction.events.push(ClientEvent::Resumed {
                    session_id,
                    delivered: frame.seq,
                });
                reaction.send = self.retransmit();
            }
            FrameBody::Ack => self.apply_ack(frame.seq, &mut reaction),
            // The host's heartbeat carries its delivery mark: an implicit ack.
            FrameBody::Heartbeat => self.apply_ack(frame.seq, &mut reaction),
            FrameBody::StatusChange { state } => {
                reaction.events.push(ClientEvent::Status(state));
            }
            FrameBody::Prompt { text } => {
                reaction.events.push(ClientEvent::HostMessage {
                    seq: frame.seq,
                    text,
                });
                reaction.send.push(Frame::ack(frame.seq));
            }
            FrameBody::Error { code, description } => {
                self.established = false;
                return Err(SessionError::Rejected { code, description });
            }
            FrameBody::Disconnect => {
                self.established = false;
                return Err(SessionError::Rejected {
                    code: ErrorCode::UnknownSession,
                    description: "host ended the session".to_string(),
                });
            }
            FrameBody::Pair { .. } => return Err(SessionError::Unexpected("Pair")),
            FrameBody::Resume => return Err(SessionError::Unexpected("Resume")),
        }

        Ok(reaction)
    }

    fn apply_ack(&mut self, seq: u64, reaction: &mut Reaction) {
        let released = self.outbox.ack_through(seq);
        if released > 0 {
            debug!("host acknowledged through {seq} ({released} released)");
            reaction.events.push(ClientEvent::Acked { seq });
        }
    }

    fn retransmit(&self) -> Vec<Frame> {
        self.outbox
            .unacked()
            .map(|(seq, text)| Frame::prompt(seq, text))
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
