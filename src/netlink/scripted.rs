//! In-memory transport for tests and dry runs.
//!
//! A [`ScriptedTransport`] stands in for the kernel: every request sent on it
//! is recorded and handed to a responder closure, whose reply datagrams are
//! queued for the next `recv`. Unsolicited events can be queued directly.
//! The transport and its [`ScriptHandle`] share state, so a test keeps the
//! handle after giving the transport to an `NlHandle`.
//!
//! ```ignore
//! let (transport, script) = ScriptedTransport::new();
//! script.set_responder(|req| vec![reply::ack(req)]);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;

use super::attr::{AttrTable, AttrTree};
use super::message::{peek_header, NlHeader, GENL_HDRLEN, NLMSG_HDRLEN};
use super::socket::{SocketRole, Transport, TransportFactory};
use crate::error::{Error, Result};

thread_local! {
    static NEXT_FAKE_FD: Cell<RawFd> = const { Cell::new(1000) };
}

fn fake_fd() -> RawFd {
    NEXT_FAKE_FD.with(|n| {
        let fd = n.get();
        n.set(fd + 1);
        fd
    })
}

/// A request captured by the scripted transport.
#[derive(Debug, Clone)]
pub struct SentRequest {
    /// Decoded netlink header.
    pub header: NlHeader,
    /// Generic-netlink command byte.
    pub cmd: u8,
    /// The full encoded request.
    pub bytes: Vec<u8>,
}

impl SentRequest {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let header = peek_header(bytes).ok_or_else(|| Error::Protocol("short request".into()))?;
        let cmd = *bytes
            .get(NLMSG_HDRLEN)
            .ok_or_else(|| Error::Protocol("request without genlmsghdr".into()))?;
        Ok(Self {
            header,
            cmd,
            bytes: bytes.to_vec(),
        })
    }

    /// Attributes of the request.
    pub fn table(&self) -> Result<AttrTable<'_>> {
        let end = (self.header.len as usize).min(self.bytes.len());
        AttrTable::parse(self.bytes.get(NLMSG_HDRLEN + GENL_HDRLEN..end).unwrap_or(&[]))
    }

    /// True for dump requests.
    pub fn is_dump(&self) -> bool {
        self.header.flags & super::message::NLM_F_DUMP == super::message::NLM_F_DUMP
    }
}

type Responder = Box<dyn FnMut(&SentRequest) -> Vec<Vec<u8>>>;

/// One queued receive result.
#[derive(Debug)]
enum Inbound {
    Datagram(Vec<u8>),
    Failure(i32),
}

impl Inbound {
    fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Self::Datagram(buf) => Ok(buf),
            Self::Failure(errno) => Err(Error::Io(std::io::Error::from_raw_os_error(errno))),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    responder: Option<Responder>,
    inbox: VecDeque<Inbound>,
    sent: Vec<SentRequest>,
    recv_calls: usize,
    memberships: Vec<u32>,
    failing_groups: HashSet<u32>,
    close_count: usize,
}

/// Shared view of a scripted transport.
#[derive(Clone)]
pub struct ScriptHandle {
    state: Rc<RefCell<ScriptState>>,
    fd: RawFd,
}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ScriptHandle")
            .field("fd", &self.fd)
            .field("sent", &state.sent.len())
            .field("inbox", &state.inbox.len())
            .finish()
    }
}

impl ScriptHandle {
    /// Replace the responder.
    pub fn set_responder(&self, f: impl FnMut(&SentRequest) -> Vec<Vec<u8>> + 'static) {
        self.state.borrow_mut().responder = Some(Box::new(f));
    }

    /// Queue a datagram for the next receive.
    pub fn push(&self, datagram: Vec<u8>) {
        self.state.borrow_mut().inbox.push_back(Inbound::Datagram(datagram));
    }

    /// Make the receive after everything queued so far fail with `errno`.
    pub fn push_failure(&self, errno: i32) {
        self.state.borrow_mut().inbox.push_back(Inbound::Failure(errno));
    }

    /// All requests sent so far.
    pub fn sent(&self) -> Vec<SentRequest> {
        self.state.borrow().sent.clone()
    }

    /// Commands of all requests sent so far.
    pub fn sent_cmds(&self) -> Vec<u8> {
        self.state.borrow().sent.iter().map(|r| r.cmd).collect()
    }

    /// Number of blocking receive calls made.
    pub fn recv_calls(&self) -> usize {
        self.state.borrow().recv_calls
    }

    /// Multicast groups currently joined.
    pub fn memberships(&self) -> Vec<u32> {
        self.state.borrow().memberships.clone()
    }

    /// Make joining `group` fail.
    pub fn fail_membership(&self, group: u32) {
        self.state.borrow_mut().failing_groups.insert(group);
    }

    /// How many transports sharing this state have been dropped.
    pub fn close_count(&self) -> usize {
        self.state.borrow().close_count
    }

    /// Datagrams and failures still queued.
    pub fn pending(&self) -> usize {
        self.state.borrow().inbox.len()
    }

    /// Fake descriptor of the transport.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Transport backed by a [`ScriptHandle`].
pub struct ScriptedTransport {
    handle: ScriptHandle,
    port: u32,
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("fd", &self.handle.fd)
            .field("port", &self.port)
            .finish()
    }
}

impl ScriptedTransport {
    /// New transport with no responder; requests get no reply.
    pub fn new() -> (Self, ScriptHandle) {
        let fd = fake_fd();
        let handle = ScriptHandle {
            state: Rc::new(RefCell::new(ScriptState::default())),
            fd,
        };
        let transport = Self {
            handle: handle.clone(),
            port: 0x4000 + fd as u32,
        };
        (transport, handle)
    }

    /// New transport answering every request through `f`.
    pub fn with_responder(f: impl FnMut(&SentRequest) -> Vec<Vec<u8>> + 'static) -> (Self, ScriptHandle) {
        let (transport, handle) = Self::new();
        handle.set_responder(f);
        (transport, handle)
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        let req = SentRequest::parse(buf)?;
        let mut state = self.handle.state.borrow_mut();
        state.sent.push(req.clone());
        let mut responder = state.responder.take();
        drop(state);
        let replies = responder.as_mut().map(|f| f(&req)).unwrap_or_default();
        let mut state = self.handle.state.borrow_mut();
        if state.responder.is_none() {
            state.responder = responder;
        }
        state.inbox.extend(replies.into_iter().map(Inbound::Datagram));
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        let mut state = self.handle.state.borrow_mut();
        state.recv_calls += 1;
        state
            .inbox
            .pop_front()
            .ok_or_else(|| Error::Protocol("scripted transport has nothing queued".into()))?
            .into_result()
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        self.handle.state.borrow_mut().inbox.pop_front().map(Inbound::into_result).transpose()
    }

    fn add_membership(&mut self, group: u32) -> Result<()> {
        let mut state = self.handle.state.borrow_mut();
        if state.failing_groups.contains(&group) {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOENT)));
        }
        if !state.memberships.contains(&group) {
            state.memberships.push(group);
        }
        Ok(())
    }

    fn drop_membership(&mut self, group: u32) -> Result<()> {
        self.handle.state.borrow_mut().memberships.retain(|&g| g != group);
        Ok(())
    }

    fn local_port(&self) -> u32 {
        self.port
    }

    fn raw_fd(&self) -> RawFd {
        self.handle.fd
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.handle.state.borrow_mut().close_count += 1;
    }
}

/// Responder shared by every transport a [`ScriptedFactory`] opens; it is
/// told which role the request arrived on.
pub type KernelFn = dyn FnMut(SocketRole, &SentRequest) -> Vec<Vec<u8>>;

/// Factory handing out scripted transports wired to one simulated kernel.
#[derive(Clone)]
pub struct ScriptedFactory {
    kernel: Rc<RefCell<Box<KernelFn>>>,
    opened: Rc<RefCell<Vec<(SocketRole, ScriptHandle)>>>,
    fail_roles: Rc<RefCell<HashSet<&'static str>>>,
}

impl fmt::Debug for ScriptedFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedFactory")
            .field("opened", &self.opened.borrow().len())
            .finish()
    }
}

impl ScriptedFactory {
    /// Factory whose transports all answer through `kernel`.
    pub fn new(kernel: impl FnMut(SocketRole, &SentRequest) -> Vec<Vec<u8>> + 'static) -> Self {
        Self {
            kernel: Rc::new(RefCell::new(Box::new(kernel))),
            opened: Rc::new(RefCell::new(Vec::new())),
            fail_roles: Rc::new(RefCell::new(HashSet::new())),
        }
    }

    /// Handles of every transport opened for `role`, oldest first.
    pub fn handles(&self, role: SocketRole) -> Vec<ScriptHandle> {
        self.opened
            .borrow()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, h)| h.clone())
            .collect()
    }

    /// Number of transports opened so far.
    pub fn opened(&self) -> usize {
        self.opened.borrow().len()
    }

    /// Make subsequent opens for `role` fail.
    pub fn fail_open(&self, role: SocketRole) {
        self.fail_roles.borrow_mut().insert(role.as_str());
    }
}

impl TransportFactory for ScriptedFactory {
    fn open(&mut self, role: SocketRole) -> Result<Box<dyn Transport>> {
        if self.fail_roles.borrow().contains(role.as_str()) {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EMFILE)));
        }
        let kernel = Rc::clone(&self.kernel);
        let (transport, handle) =
            ScriptedTransport::with_responder(move |req| (kernel.borrow_mut())(role, req));
        self.opened.borrow_mut().push((role, handle));
        Ok(Box::new(transport))
    }
}

/// Builders for reply datagrams.
pub mod reply {
    use super::*;
    use crate::netlink::message::{
        encode_error_payload, encode_nlmsg, NLMSG_DONE, NLMSG_ERROR, NLM_F_DUMP_INTR, NLM_F_MULTI,
    };

    fn error_datagram(req: &SentRequest, code: i32, msg: Option<&str>) -> Vec<u8> {
        // Only fails for an ext-ack text too long for an attribute.
        let (flags, payload) = match encode_error_payload(code, &req.header, msg) {
            Ok(encoded) => encoded,
            Err(_) => encode_error_payload(code, &req.header, None).unwrap_or_default(),
        };
        encode_nlmsg(NLMSG_ERROR, flags, req.header.seq, 0, &payload)
    }

    /// Ack (error code 0).
    pub fn ack(req: &SentRequest) -> Vec<u8> {
        error_datagram(req, 0, None)
    }

    /// Kernel error with a negative errno.
    pub fn error(req: &SentRequest, code: i32) -> Vec<u8> {
        error_datagram(req, code, None)
    }

    /// Kernel error with extended-ack text.
    pub fn error_with_msg(req: &SentRequest, code: i32, text: &str) -> Vec<u8> {
        error_datagram(req, code, Some(text))
    }

    /// Data reply to `req` carrying `attrs`. Dump replies get `NLM_F_MULTI`.
    pub fn data(req: &SentRequest, cmd: u8, attrs: &AttrTree) -> Vec<u8> {
        let flags = if req.is_dump() { NLM_F_MULTI } else { 0 };
        data_with_flags(req, cmd, attrs, flags)
    }

    /// Data reply with explicit netlink flags.
    pub fn data_with_flags(req: &SentRequest, cmd: u8, attrs: &AttrTree, flags: u16) -> Vec<u8> {
        let mut payload = vec![cmd, 0, 0, 0];
        attrs.encode_into(&mut payload);
        encode_nlmsg(req.header.msg_type, flags, req.header.seq, 0, &payload)
    }

    /// End of a dump.
    pub fn done(req: &SentRequest) -> Vec<u8> {
        encode_nlmsg(NLMSG_DONE, NLM_F_MULTI, req.header.seq, 0, &0i32.to_ne_bytes())
    }

    /// End of a dump whose contents changed while it was being produced.
    pub fn done_interrupted(req: &SentRequest) -> Vec<u8> {
        encode_nlmsg(
            NLMSG_DONE,
            NLM_F_MULTI | NLM_F_DUMP_INTR,
            req.header.seq,
            0,
            &0i32.to_ne_bytes(),
        )
    }

    /// Unsolicited multicast event (sequence 0, port 0).
    pub fn event(family: u16, cmd: u8, attrs: &AttrTree) -> Vec<u8> {
        let mut payload = vec![cmd, 0, 0, 0];
        attrs.encode_into(&mut payload);
        encode_nlmsg(family, 0, 0, 0, &payload)
    }

    /// Concatenate several messages into one datagram.
    pub fn batch(parts: impl IntoIterator<Item = Vec<u8>>) -> Vec<u8> {
        parts.into_iter().flatten().collect()
    }
}
