//! One RPC call and its retry state machine.
//!
//! Packet transports may lose calls or replies, so a call is retransmitted
//! under the same xid each time the reply timer expires. Stream transports
//! never lose data while the connection is up; a silent server there means
//! a dead connection, so the call is abandoned, the connection repaired and
//! the call resent under a fresh xid.

use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::config::MountConfig;
use crate::client::server::RpcServer;
use crate::error::{RpcError, RpcResult};
use crate::protocol::xdr::rpc::{accept_body, call_message, reply_body, rpc_body, rpc_msg};
use crate::protocol::xdr::{deserialize, Deserialize, Serialize};
use crate::transport::Protocol;

/// Abort handle for calls in flight. Cancelling it fails every call sent
/// with it with [`RpcError::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct Cookie {
    token: CancellationToken,
}

impl Cookie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts every call waiting on this cookie, now and in the future.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl From<CancellationToken> for Cookie {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}

/// How long to wait for a reply and how often to try again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Timeouts tolerated by a soft policy before the call fails
    pub retry_limit: u32,
    pub hard: bool,
}

impl RetryPolicy {
    /// Policy for session bootstrap calls, which must not hang a mount
    /// forever.
    pub fn bootstrap() -> Self {
        Self { timeout: Duration::from_secs(60), retry_limit: 5, hard: false }
    }

    fn exhausted(&self, failures: u32) -> bool {
        !self.hard && failures >= self.retry_limit.max(1)
    }
}

impl From<&MountConfig> for RetryPolicy {
    fn from(config: &MountConfig) -> Self {
        Self { timeout: config.timeout, retry_limit: config.retry_limit, hard: config.hard }
    }
}

enum Wait {
    Reply(Vec<u8>),
    TimedOut,
    Cancelled,
}

/// A call being built, sent, or holding its reply.
///
/// Reusable: after [`reset`](Self::reset) a new call can be set up, which
/// is how two-step exchanges such as negotiate-then-confirm are driven.
#[derive(Debug)]
pub struct Request {
    server: Arc<RpcServer>,
    policy: RetryPolicy,
    call: Option<Vec<u8>>,
    reply: Option<Vec<u8>>,
}

impl Request {
    /// Creates an empty request against `server`.
    ///
    /// Nothing is sent until a call has been set up with
    /// [`set_call`](Self::set_call) or [`set_call_args`](Self::set_call_args)
    /// and [`send`](Self::send) is invoked. `policy` decides how long each
    /// attempt waits and whether the call ever gives up.
    pub fn new(server: Arc<RpcServer>, policy: RetryPolicy) -> Self {
        Self { server, policy, call: None, reply: None }
    }

    /// The server handle the request goes through.
    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    /// Encodes the call header followed by the already encoded `args`.
    /// The xid is filled in at send time.
    pub fn set_call(
        &mut self,
        program: u32,
        version: u32,
        procedure: u32,
        args: &[u8],
    ) -> RpcResult<()> {
        let header = call_message(0, program, version, procedure, self.server.credential().clone());
        let mut call = Vec::with_capacity(args.len() + 128);
        header.serialize(&mut call)?;
        call.extend_from_slice(args);
        self.call = Some(call);
        self.reply = None;
        Ok(())
    }

    /// Like [`set_call`](Self::set_call) with arguments that still need
    /// encoding.
    pub fn set_call_args<T: Serialize>(
        &mut self,
        program: u32,
        version: u32,
        procedure: u32,
        args: &T,
    ) -> RpcResult<()> {
        let mut encoded = Vec::new();
        args.serialize(&mut encoded)?;
        self.set_call(program, version, procedure, &encoded)
    }

    /// Sends the call and waits for an accepted reply, retrying according
    /// to the policy. On success the procedure result is available through
    /// [`reply`](Self::reply).
    ///
    /// Over UDP the call is retransmitted under the same xid each time the
    /// reply timer expires. Over TCP a timeout or send failure abandons the
    /// xid, repairs the connection and resends under a fresh one.
    ///
    /// # Errors
    ///
    /// * [`RpcError::TimedOut`] when a soft policy runs out of attempts.
    /// * [`RpcError::Cancelled`] when `cookie` is cancelled or the server
    ///   handle shuts down. The pending call is removed either way.
    /// * [`RpcError::Rejected`] when the server answers with anything but
    ///   an accepted, successful reply.
    /// * [`RpcError::Xdr`] when no call has been set up.
    pub async fn send(&mut self, cookie: Option<&Cookie>) -> RpcResult<()> {
        let mut call = self
            .call
            .take()
            .ok_or_else(|| RpcError::Xdr("request sent without a call".to_string()))?;
        self.reply = None;
        let result = match self.server.protocol() {
            Protocol::Udp => self.send_packet(&mut call, cookie).await,
            Protocol::Tcp => self.send_stream(&mut call, cookie).await,
        };
        self.call = Some(call);
        self.reply = Some(accept_reply(result?)?);
        Ok(())
    }

    /// Procedure result bytes of the last successful send.
    pub fn reply(&self) -> Option<&[u8]> {
        self.reply.as_deref()
    }

    /// Decodes the procedure result of the last successful send.
    pub fn decode_reply<T: Deserialize + Default>(&self) -> RpcResult<T> {
        let reply = self.reply().ok_or_else(|| RpcError::Xdr("no reply received".to_string()))?;
        deserialize(&mut Cursor::new(reply)).map_err(|e| RpcError::Xdr(e.to_string()))
    }

    /// Forgets the call and its reply.
    pub fn reset(&mut self) {
        self.call = None;
        self.reply = None;
    }

    async fn send_packet(&self, call: &mut [u8], cookie: Option<&Cookie>) -> RpcResult<Vec<u8>> {
        let xid = self.server.next_xid();
        stamp_xid(call, xid);
        let mut receiver = self.server.register(xid);
        let mut timeouts = 0;
        loop {
            match self.server.send(call).await {
                Ok(()) | Err(RpcError::Aborted) => {}
                Err(e) => {
                    self.server.cancel_call(xid);
                    return Err(e);
                }
            }
            match self.wait(&mut receiver, cookie).await {
                Wait::Reply(reply) => return Ok(reply),
                Wait::Cancelled => {
                    self.server.cancel_call(xid);
                    return Err(RpcError::Cancelled);
                }
                Wait::TimedOut => {
                    timeouts += 1;
                    if self.policy.exhausted(timeouts) {
                        self.server.cancel_call(xid);
                        debug!("xid {} gave up after {} timeouts", xid, timeouts);
                        return Err(RpcError::TimedOut { attempts: timeouts });
                    }
                    trace!("Retransmitting xid {} (timeout {})", xid, timeouts);
                }
            }
        }
    }

    async fn send_stream(&self, call: &mut [u8], cookie: Option<&Cookie>) -> RpcResult<Vec<u8>> {
        let mut failures = 0;
        loop {
            let generation = self.server.generation();
            let xid = self.server.next_xid();
            stamp_xid(call, xid);
            let mut receiver = self.server.register(xid);

            let failure = match self.server.send(call).await {
                Ok(()) => match self.wait(&mut receiver, cookie).await {
                    Wait::Reply(reply) => return Ok(reply),
                    Wait::Cancelled => {
                        self.server.cancel_call(xid);
                        return Err(RpcError::Cancelled);
                    }
                    Wait::TimedOut => RpcError::TimedOut { attempts: failures + 1 },
                },
                Err(e) => e,
            };
            self.server.cancel_call(xid);
            if self.server.is_shut_down() || cookie.is_some_and(Cookie::is_cancelled) {
                return Err(RpcError::Cancelled);
            }

            failures += 1;
            if self.policy.exhausted(failures) {
                debug!("xid {} gave up after {} attempts: {}", xid, failures, failure);
                return Err(failure);
            }
            warn!(
                "Call xid {} to {} failed ({}), repairing connection",
                xid,
                self.server.peer(),
                failure
            );
            if let Err(e) = self.cancellable(self.server.repair(generation), cookie).await? {
                if !self.policy.hard {
                    return Err(e);
                }
                warn!("Repair of {} failed: {}", self.server.peer(), e);
                self.cancellable(tokio::time::sleep(self.policy.timeout), cookie).await?;
            }
        }
    }

    async fn wait(
        &self,
        receiver: &mut oneshot::Receiver<Vec<u8>>,
        cookie: Option<&Cookie>,
    ) -> Wait {
        let shutdown = self.server.shutdown_token();
        tokio::select! {
            _ = cookie_cancelled(cookie) => Wait::Cancelled,
            _ = shutdown.cancelled() => Wait::Cancelled,
            reply = receiver => match reply {
                Ok(reply) => Wait::Reply(reply),
                Err(_) => Wait::Cancelled,
            },
            _ = tokio::time::sleep(self.policy.timeout) => Wait::TimedOut,
        }
    }

    async fn cancellable<F: Future>(
        &self,
        fut: F,
        cookie: Option<&Cookie>,
    ) -> RpcResult<F::Output> {
        let shutdown = self.server.shutdown_token();
        tokio::select! {
            _ = cookie_cancelled(cookie) => Err(RpcError::Cancelled),
            _ = shutdown.cancelled() => Err(RpcError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

async fn cookie_cancelled(cookie: Option<&Cookie>) {
    match cookie {
        Some(cookie) => cookie.token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// The xid is the first word of every RPC message.
fn stamp_xid(call: &mut [u8], xid: u32) {
    call[..4].copy_from_slice(&xid.to_be_bytes());
}

/// Checks the reply header and strips it, leaving the procedure result.
fn accept_reply(message: Vec<u8>) -> RpcResult<Vec<u8>> {
    let mut cursor = Cursor::new(&message[..]);
    let header: rpc_msg = deserialize(&mut cursor).map_err(|e| RpcError::Xdr(e.to_string()))?;
    match header.body {
        rpc_body::REPLY(reply_body::MSG_ACCEPTED(accepted))
            if accepted.reply_data == accept_body::SUCCESS =>
        {
            let start = cursor.position() as usize;
            Ok(message[start..].to_vec())
        }
        rpc_body::REPLY(reply) => Err(RpcError::Rejected(reply.to_string())),
        rpc_body::CALL(_) => {
            Err(RpcError::Xdr(format!("xid {} is a call, not a reply", header.xid)))
        }
    }
}
