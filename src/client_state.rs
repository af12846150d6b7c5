//! C4: the per-connection protocol state machine. Pure and synchronous — it takes
//! parsed commands or byte counts and returns what to do next; it never touches a
//! socket or the ring buffers directly, so it can be unit-tested in isolation from
//! the IO thread (mirroring how the teacher keeps `request_flow.rs` free of
//! `io_uring` types).

use crate::error::ProtocolError;

/// Where in the conversation this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Start,
    HsHello,
    HsPoint,
    HsFetchEid,
    Idle,
    WmHeader,
    WmData,
    WData,
    RData,
}

/// How the next incoming bytes should be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Command,
    Data,
    None,
}

/// Per-flow counters: which kind of multi-event operation (if any) is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    None,
    Batch { events_left: u64, start_id: u64, end_id: u64 },
    Read { start_id: u64, limit: u64 },
}

/// The event currently being streamed in (`W_DATA`/`WM_DATA`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventProgress {
    pub id: u64,
    pub left: u64,
}

/// An op-queue record (element type of the per-connection op ring buffer, C1).
/// Named `WriteOp` for the common case, but also carries `BeginRead`: the IO
/// thread pushes one onto the same queue when `on_idle_command` returns
/// `Action::BeginRead`, so the store worker sees read and write requests for one
/// connection in the single FIFO order the wire delivered them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Start { id: u64, length: u64 },
    Data { offset: usize, length: usize },
    /// `bracket_len` is the two trailing `\n\n` bytes, which the request-flow
    /// glue leaves unreleased in the read buffer (see `request_flow`'s
    /// zero-copy doc) until the store worker commits them along with the
    /// event's payload bytes.
    End { id: u64, bracket_len: usize },
    BeginRead { start_id: u64, limit: u64 },
    /// Emitted once `POINT` identifies the ship; asks the store worker for its
    /// persisted `highest_eid` so the handshake can finish with `READY <eid>`.
    FetchEid,
}

/// Side effects the caller (the request-flow glue) must carry out in response to a
/// state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a control line (without the trailing `\n`, which the writer appends).
    Send(String),
    /// Push a write-op record onto this connection's op queue.
    Emit(WriteOp),
    /// Begin streaming a range read back to the client.
    BeginRead { start_id: u64, limit: u64 },
}

pub struct ClientState {
    pub id: u64,
    pub patp: Option<String>,
    pub patp_num: Option<u128>,
    pub highest_eid: u64,
    pub proto_state: ProtoState,
    pub read_mode: ReadMode,
    pub flow: Flow,
    pub event: Option<EventProgress>,
}

impl ClientState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            patp: None,
            patp_num: None,
            highest_eid: 0,
            proto_state: ProtoState::Start,
            read_mode: ReadMode::None,
            flow: Flow::None,
            event: None,
        }
    }

    /// Transition out of `START`: the server has just written `SEGURO 0\n` and now
    /// awaits the client's `HELLO 0`.
    pub fn begin_handshake(&mut self) {
        self.proto_state = ProtoState::HsHello;
        self.read_mode = ReadMode::Command;
    }

    /// Called once the async `highest_eid` lookup completes, finishing the handshake.
    pub fn finish_handshake(&mut self, highest_eid: u64) -> Action {
        self.highest_eid = highest_eid;
        self.proto_state = ProtoState::Idle;
        self.read_mode = ReadMode::Command;
        Action::Send(format!("READY {highest_eid}"))
    }

    /// Handles one parsed control line. Returns the actions to carry out, or a
    /// `ProtocolError` that the caller should use to terminate the connection.
    pub fn on_command(&mut self, line: &str) -> Result<Vec<Action>, ProtocolError> {
        match self.proto_state {
            ProtoState::HsHello => self.on_hello(line),
            ProtoState::HsPoint => self.on_point(line),
            ProtoState::Idle => self.on_idle_command(line),
            ProtoState::WmHeader => self.on_batch_event_header(line),
            _ => Err(ProtocolError::UnexpectedCommand(proto_state_name(self.proto_state))),
        }
    }

    fn on_hello(&mut self, line: &str) -> Result<Vec<Action>, ProtocolError> {
        if line != "HELLO 0" {
            return Err(ProtocolError::ExpectedHello);
        }
        self.proto_state = ProtoState::HsPoint;
        Ok(vec![Action::Send("IDENTIFY 0".to_string())])
    }

    fn on_point(&mut self, line: &str) -> Result<Vec<Action>, ProtocolError> {
        let patp_str = line
            .strip_prefix("POINT ")
            .ok_or(ProtocolError::ExpectedPoint)?;
        let patp_num =
            crate::patp::patp_decode(patp_str).map_err(|_| ProtocolError::InvalidPatp(patp_str.to_string()))?;
        self.patp = Some(patp_str.to_string());
        self.patp_num = Some(patp_num);
        self.proto_state = ProtoState::HsFetchEid;
        self.read_mode = ReadMode::None;
        Ok(vec![Action::Emit(WriteOp::FetchEid)])
    }

    fn on_idle_command(&mut self, line: &str) -> Result<Vec<Action>, ProtocolError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("WRITE") => {
                if line.starts_with("WRITE BATCH") {
                    let mut rest = line.strip_prefix("WRITE BATCH ").unwrap_or("").split_whitespace();
                    let n: u64 = parse_field(rest.next())?;
                    let start_id: u64 = parse_field(rest.next())?;
                    let end_id: u64 = parse_field(rest.next())?;
                    if start_id <= self.highest_eid || start_id >= end_id {
                        return Err(ProtocolError::InvalidBatchRange {
                            start_id,
                            end_id,
                            highest_eid: self.highest_eid,
                        });
                    }
                    self.flow = Flow::Batch {
                        events_left: n,
                        start_id,
                        end_id,
                    };
                    self.proto_state = ProtoState::WmHeader;
                    self.read_mode = ReadMode::Command;
                    Ok(vec![])
                } else {
                    let id: u64 = parse_field(parts.next())?;
                    let len: u64 = parse_field(parts.next())?;
                    if id <= self.highest_eid {
                        return Err(ProtocolError::StaleWrite { id, highest_eid: self.highest_eid });
                    }
                    self.event = Some(EventProgress { id, left: len });
                    self.proto_state = ProtoState::WData;
                    self.read_mode = ReadMode::Data;
                    Ok(vec![Action::Emit(WriteOp::Start { id, length: len })])
                }
            }
            Some("READ") => {
                let start_id: u64 = parse_field(parts.next())?;
                let limit: u64 = parse_field(parts.next())?;
                self.flow = Flow::Read { start_id, limit };
                self.proto_state = ProtoState::RData;
                self.read_mode = ReadMode::None;
                Ok(vec![Action::BeginRead { start_id, limit }])
            }
            _ => Err(ProtocolError::UnexpectedCommand("IDLE")),
        }
    }

    fn on_batch_event_header(&mut self, line: &str) -> Result<Vec<Action>, ProtocolError> {
        let mut parts = line
            .strip_prefix("EVENT ")
            .ok_or(ProtocolError::UnexpectedCommand("WM_HEADER"))?
            .split_whitespace();
        let id: u64 = parse_field(parts.next())?;
        let len: u64 = parse_field(parts.next())?;
        if id <= self.highest_eid {
            return Err(ProtocolError::StaleEvent { id, highest_eid: self.highest_eid });
        }
        self.event = Some(EventProgress { id, left: len });
        self.proto_state = ProtoState::WmData;
        self.read_mode = ReadMode::Data;
        Ok(vec![Action::Emit(WriteOp::Start { id, length: len })])
    }

    /// Consumes up to `available` bytes of the in-progress event's payload, emitting
    /// a single `DATA` op for however much of it is actually taken.
    /// Returns `(consumed, done)` where `done` means `event.left` has reached zero
    /// and the caller should now expect the two-byte bracket.
    pub fn consume_data(&mut self, offset: usize, available: usize) -> (usize, bool, Action) {
        let event = self.event.as_mut().expect("consume_data called outside *_DATA");
        let take = available.min(event.left as usize);
        event.left -= take as u64;
        let done = event.left == 0;
        (take, done, Action::Emit(WriteOp::Data { offset, length: take }))
    }

    /// Validates the two-byte bracket terminator and advances past the finished
    /// event, returning the follow-up actions (possibly a `READY`-style nothing, or
    /// the next batch header expectation).
    pub fn on_bracket(&mut self, bytes: [u8; 2]) -> Result<Vec<Action>, ProtocolError> {
        let event = self.event.take().expect("on_bracket called outside *_DATA");
        if bytes != *b"\n\n" {
            return Err(ProtocolError::BadBracketing { id: event.id });
        }
        let mut actions = vec![Action::Emit(WriteOp::End { id: event.id, bracket_len: bytes.len() })];
        self.highest_eid = self.highest_eid.max(event.id);
        match &mut self.flow {
            Flow::Batch { events_left, .. } => {
                *events_left -= 1;
                if *events_left == 0 {
                    self.flow = Flow::None;
                    self.proto_state = ProtoState::Idle;
                } else {
                    self.proto_state = ProtoState::WmHeader;
                }
            }
            _ => {
                self.proto_state = ProtoState::Idle;
            }
        }
        self.read_mode = ReadMode::Command;
        Ok(actions)
    }

    /// Called when a streaming read (`R_DATA`) has sent its last event.
    pub fn finish_read(&mut self) {
        self.flow = Flow::None;
        self.proto_state = ProtoState::Idle;
        self.read_mode = ReadMode::Command;
    }
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>) -> Result<T, ProtocolError> {
    field
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::UnexpectedCommand("malformed numeric field"))
}

fn proto_state_name(state: ProtoState) -> &'static str {
    match state {
        ProtoState::Start => "START",
        ProtoState::HsHello => "HS_HELLO",
        ProtoState::HsPoint => "HS_POINT",
        ProtoState::HsFetchEid => "HS_FETCH_EID",
        ProtoState::Idle => "IDLE",
        ProtoState::WmHeader => "WM_HEADER",
        ProtoState::WmData => "WM_DATA",
        ProtoState::WData => "W_DATA",
        ProtoState::RData => "R_DATA",
    }
}
