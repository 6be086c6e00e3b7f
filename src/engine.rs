//! Request/response correlation.
//!
//! [`send`] transmits one [`Request`] on an [`NlHandle`] and blocks in a
//! local receive loop until the exchange reaches a terminal message: an ack,
//! a kernel error or the `NLMSG_DONE` that ends a dump. Data replies go to
//! the request's validate closure along the way.
//!
//! Only one request is outstanding per handle. Messages that belong to
//! someone else (multicast events on an event-capable handle) are parked in
//! the handle's backlog and dispatched once the exchange completes; on a
//! command handle they are stale replies and are dropped.
//!
//! A dump whose parts carry `NLM_F_DUMP_INTR` is drained to its end and
//! reported as [`Error::DumpInterrupted`]. [`send_with_dump_retry`]
//! re-issues such dumps a bounded number of times.

use crate::error::{Error, Result};
use crate::netlink::message::{ErrorReport, GenlMsg, Message, MsgKind, NlMessage};
use crate::netlink::socket::{CbAction, NlHandle, SeqCheck};

/// Outcome chosen by a custom error closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    /// Report the kernel error to the caller.
    Fail,
    /// Treat the error as success.
    Ignore,
}

type ValidateFn<'a> = Box<dyn FnMut(&GenlMsg<'_>) -> Result<()> + 'a>;
type AckFn<'a> = Box<dyn FnMut() + 'a>;
type ErrorFn<'a> = Box<dyn FnMut(&ErrorReport) -> ErrorVerdict + 'a>;

/// A message plus the optional closures that consume its replies.
pub struct Request<'a> {
    message: Message,
    on_valid: Option<ValidateFn<'a>>,
    on_ack: Option<AckFn<'a>>,
    on_error: Option<ErrorFn<'a>>,
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("cmd", &self.message.cmd())
            .field("on_valid", &self.on_valid.is_some())
            .field("on_ack", &self.on_ack.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<'a> Request<'a> {
    /// Request with default handling for every reply class.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            on_valid: None,
            on_ack: None,
            on_error: None,
        }
    }

    /// Called for each data reply. An error is remembered, the exchange is
    /// still drained to its end, and the first error is returned.
    pub fn on_valid(mut self, f: impl FnMut(&GenlMsg<'_>) -> Result<()> + 'a) -> Self {
        self.on_valid = Some(Box::new(f));
        self
    }

    /// Called when the ack arrives.
    pub fn on_ack(mut self, f: impl FnMut() + 'a) -> Self {
        self.on_ack = Some(Box::new(f));
        self
    }

    /// Called for a kernel error; may downgrade it to success.
    pub fn on_error(mut self, f: impl FnMut(&ErrorReport) -> ErrorVerdict + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// The message being sent.
    pub fn message(&self) -> &Message {
        &self.message
    }
}

/// Send a request and wait for its terminal reply.
pub fn send(handle: &mut NlHandle, mut req: Request<'_>) -> Result<()> {
    transact(handle, &mut req)
}

/// Send a message with default handling.
pub fn send_msg(handle: &mut NlHandle, message: Message) -> Result<()> {
    send(handle, Request::new(message))
}

/// Like [`send`], but leaves the request with the caller.
///
/// Key material in the message is wiped before this returns, whatever the
/// outcome.
pub fn transact(handle: &mut NlHandle, req: &mut Request<'_>) -> Result<()> {
    let result = exchange(handle, req);
    if req.message.is_sensitive() {
        req.message.wipe();
    }
    result
}

/// Where one exchange stands.
#[derive(Debug)]
struct Progress {
    seq: u32,
    outcome: Option<Result<()>>,
    interrupted: bool,
    validate_err: Option<Error>,
}

fn exchange(handle: &mut NlHandle, req: &mut Request<'_>) -> Result<()> {
    let seq = handle.transmit(&req.message)?;
    log::trace!(
        "[Engine] {}: sent cmd {} seq {}",
        handle.label(),
        req.message.cmd(),
        seq
    );

    let mut progress = Progress {
        seq,
        outcome: None,
        interrupted: false,
        validate_err: None,
    };

    while progress.outcome.is_none() {
        let msgs = handle.recv_messages()?;
        let mut rest = msgs.into_iter();
        for msg in rest.by_ref() {
            handle_message(handle, req, &mut progress, msg);
            if progress.outcome.is_some() {
                break;
            }
        }
        // Whatever shares the datagram with the terminal message is never
        // part of this exchange.
        for msg in rest {
            park_or_drop(handle, msg, seq);
        }
    }

    let outcome = progress.outcome.unwrap_or(Ok(()));
    match outcome {
        Err(e) => Err(e),
        Ok(()) if progress.interrupted => Err(Error::DumpInterrupted),
        Ok(()) => progress.validate_err.map_or(Ok(()), Err),
    }
}

fn park_or_drop(handle: &mut NlHandle, msg: NlMessage, seq: u32) {
    match handle.seq_check() {
        SeqCheck::Disabled if msg.header.seq != seq => handle.push_backlog(msg),
        _ => log::debug!(
            "[Engine] {}: dropping message seq {} (expected {})",
            handle.label(),
            msg.header.seq,
            seq
        ),
    }
}

fn handle_message(handle: &mut NlHandle, req: &mut Request<'_>, progress: &mut Progress, msg: NlMessage) {
    if msg.header.seq != progress.seq {
        park_or_drop(handle, msg, progress.seq);
        return;
    }
    if msg.is_dump_interrupted() {
        progress.interrupted = true;
    }

    let kind = match msg.kind() {
        Ok(kind) => kind,
        Err(e) => {
            log::warn!("[Engine] {}: malformed reply: {}", handle.label(), e);
            return;
        }
    };

    match kind {
        MsgKind::Noop => {}
        MsgKind::Overrun => {
            progress.outcome = Some(Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOBUFS))));
        }
        MsgKind::Error(report) if report.code == 0 => {
            if handle.callbacks_mut().ack.run(&msg) == CbAction::Skip {
                return;
            }
            if let Some(f) = req.on_ack.as_mut() {
                f();
            }
            progress.outcome = Some(Ok(()));
        }
        MsgKind::Error(report) => {
            if handle.callbacks_mut().error.run(&msg) == CbAction::Skip {
                return;
            }
            match &report.ext_msg {
                Some(text) => log::warn!(
                    "[Engine] {}: cmd {} failed: {} ({})",
                    handle.label(),
                    req.message.cmd(),
                    report.code,
                    text
                ),
                None => log::debug!(
                    "[Engine] {}: cmd {} failed: {}",
                    handle.label(),
                    req.message.cmd(),
                    report.code
                ),
            }
            let verdict = req
                .on_error
                .as_mut()
                .map_or(ErrorVerdict::Fail, |f| f(&report));
            progress.outcome = Some(match verdict {
                ErrorVerdict::Fail => Err(report.into_error()),
                ErrorVerdict::Ignore => Ok(()),
            });
        }
        MsgKind::Done(code) => {
            if handle.callbacks_mut().finish.run(&msg) == CbAction::Skip {
                return;
            }
            progress.outcome = Some(if code < 0 { Err(Error::kernel(code)) } else { Ok(()) });
        }
        MsgKind::Data(genl) => match handle.callbacks_mut().valid.run(&msg) {
            CbAction::Skip => {}
            CbAction::Stop => progress.outcome = Some(Ok(())),
            CbAction::Proceed => {
                if let Some(f) = req.on_valid.as_mut() {
                    if let Err(e) = f(&genl) {
                        log::debug!("[Engine] {}: reply rejected: {}", handle.label(), e);
                        progress.validate_err.get_or_insert(e);
                    }
                }
            }
        },
    }
}

/// Run a dump, re-issuing it while the kernel reports it interrupted.
///
/// `make` builds a fresh message per attempt; `parse` turns each data reply
/// into an item (or `None` to skip it). Items from an interrupted attempt
/// are discarded. When every attempt is interrupted the result is a kernel
/// error carrying `-EAGAIN`.
pub fn send_with_dump_retry<T>(
    handle: &mut NlHandle,
    attempts: u32,
    mut make: impl FnMut() -> Result<Message>,
    mut parse: impl FnMut(&GenlMsg<'_>) -> Result<Option<T>>,
) -> Result<Vec<T>> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let mut items = Vec::new();
        let req = Request::new(make()?).on_valid(|genl| {
            if let Some(item) = parse(genl)? {
                items.push(item);
            }
            Ok(())
        });
        match send(handle, req) {
            Ok(()) => return Ok(items),
            Err(Error::DumpInterrupted) => {
                log::debug!(
                    "[Engine] {}: dump interrupted (attempt {}/{})",
                    handle.label(),
                    attempt,
                    attempts
                );
            }
            Err(e) => return Err(e),
        }
    }
    log::warn!("[Engine] {}: dump still interrupted after {} attempts", handle.label(), attempts);
    Err(Error::Kernel {
        code: -libc::EAGAIN,
        message: Some(format!("dump interrupted {attempts} times")),
    })
}
