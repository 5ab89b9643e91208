//! ONC RPC version 2 message layout (RFC 5531 section 9).
//!
//! The client builds CALL headers for every outgoing request and parses
//! REPLY headers to decide whether a procedure result follows. The callback
//! server does the opposite for server-initiated calls, so both directions
//! are modelled.

// Keep RFC naming conventions
#![allow(non_camel_case_types)]

use std::fmt;
use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};

use super::*;

/// The only RPC protocol version in existence.
pub const RPC_VERSION: u32 = 2;

/// Reasons a server gives for refusing our credentials.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum auth_stat {
    AUTH_OK = 0,
    #[default]
    AUTH_BADCRED = 1,
    AUTH_REJECTEDCRED = 2,
    AUTH_BADVERF = 3,
    AUTH_REJECTEDVERF = 4,
    AUTH_TOOWEAK = 5,
}
SerializeEnum!(auth_stat);
DeserializeEnum!(auth_stat);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum auth_flavor {
    #[default]
    AUTH_NULL = 0,
    AUTH_UNIX = 1,
    AUTH_SHORT = 2,
    AUTH_DES = 3,
}
SerializeEnum!(auth_flavor);
DeserializeEnum!(auth_flavor);

/// AUTH_UNIX (AUTH_SYS) credential body.
#[derive(Clone, Debug, Default)]
pub struct auth_unix {
    pub stamp: u32,
    pub machinename: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}
DeserializeStruct!(auth_unix, stamp, machinename, uid, gid, gids);
SerializeStruct!(auth_unix, stamp, machinename, uid, gid, gids);

#[derive(Clone, Debug, Default)]
pub struct opaque_auth {
    pub flavor: auth_flavor,
    pub body: Vec<u8>,
}
DeserializeStruct!(opaque_auth, flavor, body);
SerializeStruct!(opaque_auth, flavor, body);

impl opaque_auth {
    /// Wraps an AUTH_UNIX credential into its opaque envelope.
    pub fn unix(cred: &auth_unix) -> std::io::Result<opaque_auth> {
        Ok(opaque_auth { flavor: auth_flavor::AUTH_UNIX, body: to_bytes(cred)? })
    }
}

/// A complete RPC message header. Procedure arguments or results follow it
/// on the wire and are not part of this structure.
#[derive(Clone, Debug, Default)]
pub struct rpc_msg {
    /// Transaction id; a reply always carries the xid of its call.
    pub xid: u32,
    pub body: rpc_body,
}
DeserializeStruct!(rpc_msg, xid, body);
SerializeStruct!(rpc_msg, xid, body);

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug)]
pub enum rpc_body {
    CALL(call_body),
    REPLY(reply_body),
}

impl Default for rpc_body {
    fn default() -> rpc_body {
        rpc_body::CALL(call_body::default())
    }
}

impl Serialize for rpc_body {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            rpc_body::CALL(call) => {
                0_u32.serialize(dest)?;
                call.serialize(dest)
            }
            rpc_body::REPLY(reply) => {
                1_u32.serialize(dest)?;
                reply.serialize(dest)
            }
        }
    }
}

impl Deserialize for rpc_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = match deserialize::<u32>(src)? {
            0 => rpc_body::CALL(deserialize(src)?),
            1 => rpc_body::REPLY(deserialize(src)?),
            other => return Err(invalid_data(&format!("Invalid rpc message type {other}"))),
        };
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct call_body {
    pub rpcvers: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub cred: opaque_auth,
    pub verf: opaque_auth,
}
DeserializeStruct!(call_body, rpcvers, prog, vers, proc, cred, verf);
SerializeStruct!(call_body, rpcvers, prog, vers, proc, cred, verf);

#[derive(Clone, Debug)]
pub enum reply_body {
    MSG_ACCEPTED(accepted_reply),
    MSG_DENIED(rejected_reply),
}

impl Default for reply_body {
    fn default() -> reply_body {
        reply_body::MSG_ACCEPTED(accepted_reply::default())
    }
}

impl Serialize for reply_body {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            reply_body::MSG_ACCEPTED(accepted) => {
                0_u32.serialize(dest)?;
                accepted.serialize(dest)
            }
            reply_body::MSG_DENIED(rejected) => {
                1_u32.serialize(dest)?;
                rejected.serialize(dest)
            }
        }
    }
}

impl Deserialize for reply_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = match deserialize::<u32>(src)? {
            0 => reply_body::MSG_ACCEPTED(deserialize(src)?),
            1 => reply_body::MSG_DENIED(deserialize(src)?),
            other => return Err(invalid_data(&format!("Invalid reply status {other}"))),
        };
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct mismatch_info {
    pub low: u32,
    pub high: u32,
}
DeserializeStruct!(mismatch_info, low, high);
SerializeStruct!(mismatch_info, low, high);

#[derive(Clone, Debug, Default)]
pub struct accepted_reply {
    pub verf: opaque_auth,
    pub reply_data: accept_body,
}
DeserializeStruct!(accepted_reply, verf, reply_data);
SerializeStruct!(accepted_reply, verf, reply_data);

/// Outcome of an accepted call, discriminated by `accept_stat`.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum accept_body {
    #[default]
    SUCCESS,
    PROG_UNAVAIL,
    PROG_MISMATCH(mismatch_info),
    PROC_UNAVAIL,
    GARBAGE_ARGS,
    SYSTEM_ERR,
}

impl Serialize for accept_body {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            accept_body::SUCCESS => 0_u32.serialize(dest),
            accept_body::PROG_UNAVAIL => 1_u32.serialize(dest),
            accept_body::PROG_MISMATCH(range) => {
                2_u32.serialize(dest)?;
                range.serialize(dest)
            }
            accept_body::PROC_UNAVAIL => 3_u32.serialize(dest),
            accept_body::GARBAGE_ARGS => 4_u32.serialize(dest),
            accept_body::SYSTEM_ERR => 5_u32.serialize(dest),
        }
    }
}

impl Deserialize for accept_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = match deserialize::<u32>(src)? {
            0 => accept_body::SUCCESS,
            1 => accept_body::PROG_UNAVAIL,
            2 => accept_body::PROG_MISMATCH(deserialize(src)?),
            3 => accept_body::PROC_UNAVAIL,
            4 => accept_body::GARBAGE_ARGS,
            5 => accept_body::SYSTEM_ERR,
            other => return Err(invalid_data(&format!("Invalid accept stat {other}"))),
        };
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum rejected_reply {
    RPC_MISMATCH(mismatch_info),
    AUTH_ERROR(auth_stat),
}

impl Default for rejected_reply {
    fn default() -> rejected_reply {
        rejected_reply::AUTH_ERROR(auth_stat::default())
    }
}

impl Serialize for rejected_reply {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            rejected_reply::RPC_MISMATCH(range) => {
                0_u32.serialize(dest)?;
                range.serialize(dest)
            }
            rejected_reply::AUTH_ERROR(stat) => {
                1_u32.serialize(dest)?;
                stat.serialize(dest)
            }
        }
    }
}

impl Deserialize for rejected_reply {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = match deserialize::<u32>(src)? {
            0 => rejected_reply::RPC_MISMATCH(deserialize(src)?),
            1 => rejected_reply::AUTH_ERROR(deserialize(src)?),
            other => return Err(invalid_data(&format!("Invalid reject stat {other}"))),
        };
        Ok(())
    }
}

impl fmt::Display for reply_body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            reply_body::MSG_ACCEPTED(accepted) => match &accepted.reply_data {
                accept_body::SUCCESS => write!(f, "success"),
                accept_body::PROG_UNAVAIL => write!(f, "program unavailable"),
                accept_body::PROG_MISMATCH(range) => {
                    write!(f, "program version mismatch ({}..={})", range.low, range.high)
                }
                accept_body::PROC_UNAVAIL => write!(f, "procedure unavailable"),
                accept_body::GARBAGE_ARGS => write!(f, "garbage arguments"),
                accept_body::SYSTEM_ERR => write!(f, "system error"),
            },
            reply_body::MSG_DENIED(rejected_reply::RPC_MISMATCH(range)) => {
                write!(f, "rpc version mismatch ({}..={})", range.low, range.high)
            }
            reply_body::MSG_DENIED(rejected_reply::AUTH_ERROR(stat)) => {
                write!(f, "authentication error {stat:?}")
            }
        }
    }
}

/// Builds the header of an outgoing call.
pub fn call_message(xid: u32, prog: u32, vers: u32, proc: u32, cred: opaque_auth) -> rpc_msg {
    let call = call_body {
        rpcvers: RPC_VERSION,
        prog,
        vers,
        proc,
        cred,
        verf: opaque_auth::default(),
    };
    rpc_msg { xid, body: rpc_body::CALL(call) }
}

fn accepted(xid: u32, reply_data: accept_body) -> rpc_msg {
    let verf = opaque_auth::default();
    let reply = reply_body::MSG_ACCEPTED(accepted_reply { verf, reply_data });
    rpc_msg { xid, body: rpc_body::REPLY(reply) }
}

/// Successful reply header; procedure results follow.
pub fn make_success_reply(xid: u32) -> rpc_msg {
    accepted(xid, accept_body::SUCCESS)
}

pub fn prog_unavail_reply_message(xid: u32) -> rpc_msg {
    accepted(xid, accept_body::PROG_UNAVAIL)
}

pub fn prog_mismatch_reply_message(xid: u32, accepted_ver: u32) -> rpc_msg {
    accepted(
        xid,
        accept_body::PROG_MISMATCH(mismatch_info { low: accepted_ver, high: accepted_ver }),
    )
}

pub fn proc_unavail_reply_message(xid: u32) -> rpc_msg {
    accepted(xid, accept_body::PROC_UNAVAIL)
}

pub fn garbage_args_reply_message(xid: u32) -> rpc_msg {
    accepted(xid, accept_body::GARBAGE_ARGS)
}

pub fn rpc_vers_mismatch(xid: u32) -> rpc_msg {
    let range = mismatch_info { low: RPC_VERSION, high: RPC_VERSION };
    let reply = reply_body::MSG_DENIED(rejected_reply::RPC_MISMATCH(range));
    rpc_msg { xid, body: rpc_body::REPLY(reply) }
}

/// Reads the xid without decoding the rest of the header. Used by the
/// reply reader to route a message before anyone parses it.
pub fn peek_xid(message: &[u8]) -> Option<u32> {
    let word: [u8; 4] = message.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(word))
}
