//! Netlink socket handles.
//!
//! # Layers
//!
//! - [`Transport`]: raw datagram I/O on one descriptor. [`NetlinkSocket`] is
//!   the `AF_NETLINK` implementation; the scripted transport replaces it in
//!   tests.
//! - [`NlHandle`]: a transport plus the per-handle state the request engine
//!   needs: a sequence counter, a [`CallbackTable`], the reactor
//!   registration state and a backlog of unrelated messages that arrived
//!   while a request was in flight.
//!
//! All handles are used from the single reactor thread.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use super::message::{Message, NlMessage};
use crate::constants::{DEFAULT_EVENT_RX_BUFFER_SIZE, DEFAULT_RX_BUFFER_SIZE, EVENT_SOCKET_RCVBUF};
use crate::error::{Error, Result};
use crate::nl80211::consts::NETLINK_GENERIC;
use crate::reactor::FdState;

const SOL_NETLINK: libc::c_int = 270;
const NETLINK_ADD_MEMBERSHIP: libc::c_int = 1;
const NETLINK_DROP_MEMBERSHIP: libc::c_int = 2;
const NETLINK_CAP_ACK: libc::c_int = 10;
const NETLINK_EXT_ACK: libc::c_int = 11;

// ─── Transport ─────────────────────────────────────────────────────────────

/// Datagram I/O for one netlink descriptor.
pub trait Transport: fmt::Debug {
    /// Send one datagram.
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Block until a datagram arrives.
    fn recv(&mut self) -> Result<Vec<u8>>;

    /// Return a pending datagram without blocking, or `None`.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Join a multicast group by numeric id.
    fn add_membership(&mut self, group: u32) -> Result<()>;

    /// Leave a multicast group.
    fn drop_membership(&mut self, group: u32) -> Result<()>;

    /// Port id the kernel assigned at bind time.
    fn local_port(&self) -> u32;

    /// Descriptor to register with the reactor.
    fn raw_fd(&self) -> RawFd;
}

/// What an auxiliary socket is opened for. Event-carrying roles get a larger
/// kernel receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Global command socket.
    Command,
    /// Global multicast event socket.
    Event,
    /// Per-interface management-frame socket.
    Mgmt,
    /// Per-interface connection-owner socket.
    Connect,
    /// Shared per-radio beacon listener.
    Listener,
}

impl SocketRole {
    /// Whether messages on this socket come from unrelated senders, so
    /// sequence checking must be disabled.
    pub fn carries_events(self) -> bool {
        !matches!(self, Self::Command)
    }

    /// Short name used in handle labels and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Mgmt => "mgmt",
            Self::Connect => "connect",
            Self::Listener => "listener",
        }
    }
}

/// Opens transports for new handles.
pub trait TransportFactory {
    /// Open a fresh, bound transport for `role`.
    fn open(&mut self, role: SocketRole) -> Result<Box<dyn Transport>>;
}

/// Generic netlink socket over `libc`.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    port: u32,
    rx_buf: Vec<u8>,
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl NetlinkSocket {
    /// Open and bind a `NETLINK_GENERIC` socket.
    pub fn open(rx_buffer_size: usize) -> Result<Self> {
        // SAFETY: socket(2) with constant arguments; the result is checked.
        let raw = check(unsafe {
            libc::socket(libc::AF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, NETLINK_GENERIC)
        })?;
        // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let addr_len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        // SAFETY: addr points to a valid sockaddr_nl of addr_len bytes.
        check(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast(),
                addr_len,
            )
        })?;

        // SAFETY: as above.
        let mut bound: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let mut bound_len = addr_len;
        // SAFETY: bound/bound_len describe a writable sockaddr_nl.
        check(unsafe {
            libc::getsockname(
                fd.as_raw_fd(),
                (&mut bound as *mut libc::sockaddr_nl).cast(),
                &mut bound_len,
            )
        })?;

        let socket = Self {
            fd,
            port: bound.nl_pid,
            rx_buf: vec![0; rx_buffer_size.max(4096)],
        };

        // Older kernels lack these; requests still work without the text.
        if let Err(e) = socket.set_opt(SOL_NETLINK, NETLINK_EXT_ACK, 1) {
            log::debug!("[Engine] NETLINK_EXT_ACK unavailable: {}", e);
        }
        if let Err(e) = socket.set_opt(SOL_NETLINK, NETLINK_CAP_ACK, 1) {
            log::debug!("[Engine] NETLINK_CAP_ACK unavailable: {}", e);
        }

        Ok(socket)
    }

    fn set_opt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        // SAFETY: value is a live c_int for the duration of the call.
        check(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                level,
                name,
                (&value as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    /// Request a kernel-side receive buffer of `bytes`.
    pub fn set_rcvbuf(&self, bytes: usize) -> Result<()> {
        let bytes = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
        self.set_opt(libc::SOL_SOCKET, libc::SO_RCVBUF, bytes)?;
        Ok(())
    }

    fn recv_with(&mut self, flags: libc::c_int) -> Result<Option<Vec<u8>>> {
        loop {
            // Peek the real datagram size first so large dump parts are never truncated.
            // SAFETY: rx_buf is a writable buffer of rx_buf.len() bytes.
            let peeked = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.rx_buf.as_mut_ptr().cast(),
                    self.rx_buf.len(),
                    flags | libc::MSG_PEEK | libc::MSG_TRUNC,
                )
            };
            if peeked < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(None),
                    _ => return Err(err.into()),
                }
            }
            let size = peeked as usize;
            if size > self.rx_buf.len() {
                self.rx_buf.resize(size, 0);
            }

            // SAFETY: as above; the buffer now fits the whole datagram.
            let got = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.rx_buf.as_mut_ptr().cast(),
                    self.rx_buf.len(),
                    flags,
                )
            };
            if got < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(None),
                    _ => return Err(err.into()),
                }
            }
            return Ok(Some(self.rx_buf[..got as usize].to_vec()));
        }
    }
}

impl Transport for NetlinkSocket {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        // SAFETY: zeroed sockaddr_nl addresses the kernel (pid 0).
        let mut dest: libc::sockaddr_nl = unsafe { mem::zeroed() };
        dest.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        loop {
            // SAFETY: buf and dest are valid for the given lengths.
            let sent = unsafe {
                libc::sendto(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    0,
                    (&dest as *const libc::sockaddr_nl).cast(),
                    mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if sent < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if sent as usize != buf.len() {
                return Err(Error::Protocol(format!("short send: {sent} of {} bytes", buf.len())));
            }
            return Ok(());
        }
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        match self.recv_with(0)? {
            Some(buf) => Ok(buf),
            None => Err(Error::Io(io::Error::from(io::ErrorKind::WouldBlock))),
        }
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        self.recv_with(libc::MSG_DONTWAIT)
    }

    fn add_membership(&mut self, group: u32) -> Result<()> {
        let group = libc::c_int::try_from(group)
            .map_err(|_| Error::Protocol(format!("multicast group id {group} out of range")))?;
        self.set_opt(SOL_NETLINK, NETLINK_ADD_MEMBERSHIP, group)?;
        Ok(())
    }

    fn drop_membership(&mut self, group: u32) -> Result<()> {
        let group = libc::c_int::try_from(group)
            .map_err(|_| Error::Protocol(format!("multicast group id {group} out of range")))?;
        self.set_opt(SOL_NETLINK, NETLINK_DROP_MEMBERSHIP, group)?;
        Ok(())
    }

    fn local_port(&self) -> u32 {
        self.port
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Opens real netlink sockets sized from the driver configuration.
#[derive(Debug, Clone)]
pub struct NetlinkSocketFactory {
    /// User-space receive buffer for command sockets.
    pub rx_buffer_size: usize,
    /// User-space receive buffer for event-carrying sockets.
    pub event_rx_buffer_size: usize,
}

impl Default for NetlinkSocketFactory {
    fn default() -> Self {
        Self {
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            event_rx_buffer_size: DEFAULT_EVENT_RX_BUFFER_SIZE,
        }
    }
}

impl TransportFactory for NetlinkSocketFactory {
    fn open(&mut self, role: SocketRole) -> Result<Box<dyn Transport>> {
        let size = if role.carries_events() {
            self.event_rx_buffer_size
        } else {
            self.rx_buffer_size
        };
        let socket = NetlinkSocket::open(size)?;
        if role == SocketRole::Event {
            if let Err(e) = socket.set_rcvbuf(EVENT_SOCKET_RCVBUF) {
                log::warn!("[Engine] Could not enlarge event socket buffer: {}", e);
            }
        }
        Ok(Box::new(socket))
    }
}

// ─── Callback table ────────────────────────────────────────────────────────

/// Result of a handle-level callback, in libnl terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbAction {
    /// Continue with the default handling for this message.
    Proceed,
    /// Ignore this message.
    Skip,
    /// Terminate the receive loop now.
    Stop,
}

/// Boxed handle-level callback.
pub type HandlerFn = Box<dyn FnMut(&NlMessage) -> CbAction>;

/// Handler slot for one message class.
#[derive(Default)]
pub enum Handler {
    /// Engine default behavior.
    #[default]
    Default,
    /// Ignore messages of this class.
    Skip,
    /// Call this closure first.
    Custom(HandlerFn),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Skip => f.write_str("Skip"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Handler {
    /// Resolve this slot for `msg`.
    pub fn run(&mut self, msg: &NlMessage) -> CbAction {
        match self {
            Self::Default => CbAction::Proceed,
            Self::Skip => CbAction::Skip,
            Self::Custom(f) => f(msg),
        }
    }
}

/// Whether replies must carry the sequence number of the outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// Mismatches are dropped.
    Strict,
    /// Mismatches are unrelated traffic and are kept for dispatch.
    Disabled,
}

/// Handlers keyed by message class.
#[derive(Debug)]
pub struct CallbackTable {
    /// Data messages.
    pub valid: Handler,
    /// Error messages carrying code 0.
    pub ack: Handler,
    /// Error messages carrying a negative errno.
    pub error: Handler,
    /// `NLMSG_DONE`.
    pub finish: Handler,
    /// Sequence number policy.
    pub seq_check: SeqCheck,
}

impl CallbackTable {
    /// Table for a command handle: engine defaults, strict sequence checks.
    pub fn command() -> Self {
        Self {
            valid: Handler::Default,
            ack: Handler::Default,
            error: Handler::Default,
            finish: Handler::Default,
            seq_check: SeqCheck::Strict,
        }
    }

    /// Table for a handle that also receives multicast or unsolicited traffic.
    pub fn events() -> Self {
        Self {
            seq_check: SeqCheck::Disabled,
            ..Self::command()
        }
    }

    /// Table matching `role`.
    pub fn for_role(role: SocketRole) -> Self {
        if role.carries_events() {
            Self::events()
        } else {
            Self::command()
        }
    }
}

// ─── Handle ────────────────────────────────────────────────────────────────

/// Result of [`NlHandle::drain_pending`].
#[derive(Debug, Default)]
pub struct Drained {
    /// Messages in arrival order, backlog first.
    pub messages: Vec<NlMessage>,
    /// Receive failure that stopped the drain, if any.
    pub error: Option<Error>,
}

/// One netlink connection plus its request bookkeeping.
#[derive(Debug)]
pub struct NlHandle {
    label: String,
    transport: Box<dyn Transport>,
    callbacks: CallbackTable,
    seq: u32,
    fd_state: FdState,
    backlog: VecDeque<NlMessage>,
}

impl NlHandle {
    /// Wrap a transport. The handle starts unregistered from the reactor.
    pub fn new(label: impl Into<String>, transport: Box<dyn Transport>, callbacks: CallbackTable) -> Self {
        let fd = transport.raw_fd();
        // Starting from the clock keeps stale replies from an earlier process out.
        let seq = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1)
            .max(1);
        Self {
            label: label.into(),
            transport,
            callbacks,
            seq,
            fd_state: FdState::Unregistered(fd),
            backlog: VecDeque::new(),
        }
    }

    /// Open a handle for `role` through `factory`.
    pub fn open(factory: &mut dyn TransportFactory, role: SocketRole, label: impl Into<String>) -> Result<Self> {
        let transport = factory.open(role)?;
        Ok(Self::new(label, transport, CallbackTable::for_role(role)))
    }

    /// Human-readable label for logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Underlying descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd_state.fd()
    }

    /// Reactor registration state.
    pub fn fd_state(&self) -> FdState {
        self.fd_state
    }

    /// Record that the descriptor was registered with the reactor.
    pub fn mark_registered(&mut self) {
        self.fd_state = FdState::Registered(self.fd_state.fd());
    }

    /// Record that the descriptor was removed from the reactor.
    pub fn mark_unregistered(&mut self) {
        self.fd_state = FdState::Unregistered(self.fd_state.fd());
    }

    /// Port id of the underlying socket.
    pub fn local_port(&self) -> u32 {
        self.transport.local_port()
    }

    /// Callback table.
    pub fn callbacks_mut(&mut self) -> &mut CallbackTable {
        &mut self.callbacks
    }

    /// Sequence policy of this handle.
    pub fn seq_check(&self) -> SeqCheck {
        self.callbacks.seq_check
    }

    /// Allocate the next sequence number (never 0, which multicast uses).
    pub fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        self.seq
    }

    /// Encode and transmit `msg`, returning the sequence number used.
    pub fn transmit(&mut self, msg: &Message) -> Result<u32> {
        let seq = self.next_seq();
        let bytes = msg.encode(seq, self.transport.local_port());
        self.transport.send(&bytes)?;
        Ok(seq)
    }

    /// Block for the next datagram and split it into messages.
    pub fn recv_messages(&mut self) -> Result<Vec<NlMessage>> {
        let buf = self.transport.recv()?;
        super::message::parse_datagram(&buf)
    }

    /// Keep an unrelated message for the next dispatch.
    pub fn push_backlog(&mut self, msg: NlMessage) {
        self.backlog.push_back(msg);
    }

    /// Number of messages waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Everything ready to dispatch without blocking: the backlog first,
    /// then any datagrams pending on the descriptor.
    ///
    /// A receive failure ends the drain but keeps what was collected before
    /// it. Malformed datagrams are skipped.
    pub fn drain_pending(&mut self) -> Drained {
        let mut drained = Drained {
            messages: self.backlog.drain(..).collect(),
            error: None,
        };
        loop {
            match self.transport.try_recv() {
                Ok(Some(buf)) => match super::message::parse_datagram(&buf) {
                    Ok(messages) => drained.messages.extend(messages),
                    Err(e) => log::warn!("[Engine] {}: skipping malformed datagram: {}", self.label, e),
                },
                Ok(None) => break,
                Err(e) => {
                    drained.error = Some(e);
                    break;
                }
            }
        }
        drained
    }

    /// Join a multicast group.
    pub fn add_membership(&mut self, group: u32) -> Result<()> {
        self.transport.add_membership(group)
    }

    /// Leave a multicast group.
    pub fn drop_membership(&mut self, group: u32) -> Result<()> {
        self.transport.drop_membership(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::AttrTree;
    use crate::netlink::message::parse_datagram;
    use crate::netlink::scripted::{reply, ScriptedTransport};

    #[test]
    fn test_seq_is_never_zero() {
        let (transport, _script) = ScriptedTransport::new();
        let mut handle = NlHandle::new("t", Box::new(transport), CallbackTable::command());
        handle.seq = u32::MAX;
        assert_eq!(handle.next_seq(), 1);
        assert_eq!(handle.next_seq(), 2);
    }

    #[test]
    fn test_registration_state_tracks_fd() {
        let (transport, _script) = ScriptedTransport::new();
        let mut handle = NlHandle::new("t", Box::new(transport), CallbackTable::events());
        let fd = handle.fd();
        assert_eq!(handle.fd_state(), FdState::Unregistered(fd));
        handle.mark_registered();
        assert_eq!(handle.fd_state(), FdState::Registered(fd));
        handle.mark_unregistered();
        assert!(!handle.fd_state().is_registered());
    }

    #[test]
    fn test_role_tables() {
        assert_eq!(CallbackTable::for_role(SocketRole::Command).seq_check, SeqCheck::Strict);
        for role in [SocketRole::Event, SocketRole::Mgmt, SocketRole::Connect, SocketRole::Listener] {
            assert_eq!(CallbackTable::for_role(role).seq_check, SeqCheck::Disabled);
        }
    }

    fn event(cmd: u8) -> Vec<u8> {
        reply::event(0x1c, cmd, &AttrTree::new())
    }

    #[test]
    fn test_drain_keeps_messages_read_before_failure() {
        let (transport, script) = ScriptedTransport::new();
        let mut handle = NlHandle::new("t", Box::new(transport), CallbackTable::events());
        handle.push_backlog(parse_datagram(&event(34)).unwrap().remove(0));
        script.push(event(35));
        script.push_failure(libc::ENOBUFS);
        script.push(event(36));

        let drained = handle.drain_pending();
        let cmds: Vec<u8> = drained.messages.iter().map(|m| m.genl().unwrap().cmd).collect();
        assert_eq!(cmds, vec![34, 35]);
        assert!(drained.error.is_some_and(|e| e.is_errno(libc::ENOBUFS)));
        assert_eq!(handle.backlog_len(), 0);

        let rest = handle.drain_pending();
        assert_eq!(rest.messages.len(), 1);
        assert!(rest.error.is_none());
    }

    #[test]
    fn test_drain_skips_malformed_datagram() {
        let (transport, script) = ScriptedTransport::new();
        let mut handle = NlHandle::new("t", Box::new(transport), CallbackTable::events());
        let mut truncated = event(34);
        truncated[0] = 0xff;
        script.push(truncated);
        script.push(event(35));

        let drained = handle.drain_pending();
        assert!(drained.error.is_none());
        assert_eq!(drained.messages.len(), 1);
        assert_eq!(drained.messages[0].genl().unwrap().cmd, 35);
    }

    #[test]
    fn test_custom_handler_runs() {
        let mut handler = Handler::Custom(Box::new(|_| CbAction::Stop));
        let msg = NlMessage {
            header: crate::netlink::message::NlHeader {
                len: 16,
                msg_type: 3,
                flags: 0,
                seq: 0,
                pid: 0,
            },
            payload: Vec::new(),
        };
        assert_eq!(handler.run(&msg), CbAction::Stop);
        assert_eq!(Handler::Skip.run(&msg), CbAction::Skip);
        assert_eq!(Handler::Default.run(&msg), CbAction::Proceed);
    }
}
