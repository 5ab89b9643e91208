//! NFS version 4.0 (RFC 7530) types needed by the session layer.
//!
//! Only the lease bootstrap operations (SETCLIENTID, SETCLIENTID_CONFIRM,
//! RENEW) and the callback program (CB_GETATTR, CB_RECALL) are covered.
//! Everything else travels as opaque bytes.

// Keep RFC naming conventions
#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tracing::warn;

use super::*;

/// NFS program number.
pub const PROGRAM: u32 = 100003;
/// NFS protocol version implemented by this client.
pub const VERSION: u32 = 4;
pub const NFSPROC4_NULL: u32 = 0;
pub const NFSPROC4_COMPOUND: u32 = 1;

/// Callback program number the client registers in SETCLIENTID unless
/// configured otherwise. RFC 7530 leaves the choice to the client.
pub const DEFAULT_CB_PROGRAM: u32 = 0x4000_0000;
pub const CB_VERSION: u32 = 1;
pub const CB_NULL: u32 = 0;
pub const CB_COMPOUND: u32 = 1;

pub const NFS4_FHSIZE: usize = 128;
pub const NFS4_VERIFIER_SIZE: usize = 8;
pub const NFS4_OTHER_SIZE: usize = 12;

/// Attribute numbers reported through CB_GETATTR.
pub const FATTR4_CHANGE: u32 = 3;
pub const FATTR4_SIZE: u32 = 4;

pub type verifier4 = [u8; NFS4_VERIFIER_SIZE];
pub type clientid4 = u64;
pub type bitmap4 = Vec<u32>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum nfsstat4 {
    #[default]
    NFS4_OK = 0,
    NFS4ERR_PERM = 1,
    NFS4ERR_NOENT = 2,
    NFS4ERR_IO = 5,
    NFS4ERR_ACCESS = 13,
    NFS4ERR_INVAL = 22,
    NFS4ERR_BADHANDLE = 10001,
    NFS4ERR_SERVERFAULT = 10006,
    NFS4ERR_DELAY = 10008,
    NFS4ERR_EXPIRED = 10011,
    NFS4ERR_CLID_INUSE = 10017,
    NFS4ERR_RESOURCE = 10018,
    NFS4ERR_MINOR_VERS_MISMATCH = 10021,
    NFS4ERR_STALE_CLIENTID = 10022,
    NFS4ERR_STALE_STATEID = 10023,
    NFS4ERR_BAD_STATEID = 10025,
    NFS4ERR_LEASE_MOVED = 10031,
    NFS4ERR_BADXDR = 10036,
    NFS4ERR_OP_ILLEGAL = 10044,
    NFS4ERR_CB_PATH_DOWN = 10048,
}
SerializeEnum!(nfsstat4);

/// Servers may answer with codes this client never acts on; those collapse
/// into `NFS4ERR_SERVERFAULT` instead of failing the whole decode.
impl Deserialize for nfsstat4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let code = deserialize::<u32>(src)?;
        *self = nfsstat4::from_u32(code).unwrap_or_else(|| {
            warn!("Unrecognized nfsstat4 {}", code);
            nfsstat4::NFS4ERR_SERVERFAULT
        });
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum nfs_opnum4 {
    OP_RENEW = 30,
    OP_SETCLIENTID = 35,
    OP_SETCLIENTID_CONFIRM = 36,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum nfs_cb_opnum4 {
    OP_CB_GETATTR = 3,
    OP_CB_RECALL = 4,
    OP_CB_ILLEGAL = 10044,
}

/// Opaque file handle, at most [`NFS4_FHSIZE`] bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct nfs_fh4(pub Vec<u8>);

impl Serialize for nfs_fh4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.0.serialize(dest)
    }
}

impl Deserialize for nfs_fh4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.0.deserialize(src)?;
        if self.0.len() > NFS4_FHSIZE {
            return Err(invalid_data("file handle longer than NFS4_FHSIZE"));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct stateid4 {
    pub seqid: u32,
    pub other: [u8; NFS4_OTHER_SIZE],
}
DeserializeStruct!(stateid4, seqid, other);
SerializeStruct!(stateid4, seqid, other);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct nfs_client_id4 {
    pub verifier: verifier4,
    pub id: Vec<u8>,
}
DeserializeStruct!(nfs_client_id4, verifier, id);
SerializeStruct!(nfs_client_id4, verifier, id);

/// Universal address of the client's callback endpoint (RFC 5665).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct clientaddr4 {
    pub r_netid: String,
    pub r_addr: String,
}
DeserializeStruct!(clientaddr4, r_netid, r_addr);
SerializeStruct!(clientaddr4, r_netid, r_addr);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct cb_client4 {
    pub cb_program: u32,
    pub cb_location: clientaddr4,
}
DeserializeStruct!(cb_client4, cb_program, cb_location);
SerializeStruct!(cb_client4, cb_program, cb_location);

#[derive(Clone, Debug, Default)]
pub struct SETCLIENTID4args {
    pub client: nfs_client_id4,
    pub callback: cb_client4,
    pub callback_ident: u32,
}
DeserializeStruct!(SETCLIENTID4args, client, callback, callback_ident);
SerializeStruct!(SETCLIENTID4args, client, callback, callback_ident);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SETCLIENTID4resok {
    pub clientid: clientid4,
    pub setclientid_confirm: verifier4,
}
DeserializeStruct!(SETCLIENTID4resok, clientid, setclientid_confirm);
SerializeStruct!(SETCLIENTID4resok, clientid, setclientid_confirm);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SETCLIENTID4res {
    Ok(SETCLIENTID4resok),
    /// Another client already holds this identity; carries its callback address.
    ClidInUse(clientaddr4),
    Err(nfsstat4),
}

impl Default for SETCLIENTID4res {
    fn default() -> Self {
        SETCLIENTID4res::Err(nfsstat4::NFS4ERR_SERVERFAULT)
    }
}

impl Serialize for SETCLIENTID4res {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            SETCLIENTID4res::Ok(resok) => {
                nfsstat4::NFS4_OK.serialize(dest)?;
                resok.serialize(dest)
            }
            SETCLIENTID4res::ClidInUse(addr) => {
                nfsstat4::NFS4ERR_CLID_INUSE.serialize(dest)?;
                addr.serialize(dest)
            }
            SETCLIENTID4res::Err(stat) => stat.serialize(dest),
        }
    }
}

impl Deserialize for SETCLIENTID4res {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = match deserialize::<nfsstat4>(src)? {
            nfsstat4::NFS4_OK => SETCLIENTID4res::Ok(deserialize(src)?),
            nfsstat4::NFS4ERR_CLID_INUSE => SETCLIENTID4res::ClidInUse(deserialize(src)?),
            stat => SETCLIENTID4res::Err(stat),
        };
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SETCLIENTID_CONFIRM4args {
    pub clientid: clientid4,
    pub setclientid_confirm: verifier4,
}
DeserializeStruct!(SETCLIENTID_CONFIRM4args, clientid, setclientid_confirm);
SerializeStruct!(SETCLIENTID_CONFIRM4args, clientid, setclientid_confirm);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RENEW4args {
    pub clientid: clientid4,
}
DeserializeStruct!(RENEW4args, clientid);
SerializeStruct!(RENEW4args, clientid);

/// One operation of a COMPOUND request.
#[derive(Clone, Debug)]
pub enum nfs_argop4 {
    RENEW(RENEW4args),
    SETCLIENTID(SETCLIENTID4args),
    SETCLIENTID_CONFIRM(SETCLIENTID_CONFIRM4args),
}

impl nfs_argop4 {
    pub fn opnum(&self) -> nfs_opnum4 {
        match self {
            nfs_argop4::RENEW(_) => nfs_opnum4::OP_RENEW,
            nfs_argop4::SETCLIENTID(_) => nfs_opnum4::OP_SETCLIENTID,
            nfs_argop4::SETCLIENTID_CONFIRM(_) => nfs_opnum4::OP_SETCLIENTID_CONFIRM,
        }
    }
}

impl Serialize for nfs_argop4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        (self.opnum() as u32).serialize(dest)?;
        match self {
            nfs_argop4::RENEW(args) => args.serialize(dest),
            nfs_argop4::SETCLIENTID(args) => args.serialize(dest),
            nfs_argop4::SETCLIENTID_CONFIRM(args) => args.serialize(dest),
        }
    }
}

impl Default for nfs_argop4 {
    fn default() -> Self {
        nfs_argop4::RENEW(RENEW4args::default())
    }
}

impl Deserialize for nfs_argop4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let op = deserialize::<u32>(src)?;
        *self = match nfs_opnum4::from_u32(op) {
            Some(nfs_opnum4::OP_RENEW) => nfs_argop4::RENEW(deserialize(src)?),
            Some(nfs_opnum4::OP_SETCLIENTID) => nfs_argop4::SETCLIENTID(deserialize(src)?),
            Some(nfs_opnum4::OP_SETCLIENTID_CONFIRM) => {
                nfs_argop4::SETCLIENTID_CONFIRM(deserialize(src)?)
            }
            None => return Err(invalid_data(&format!("Unsupported operation {op}"))),
        };
        Ok(())
    }
}

/// COMPOUND request: a tag, the minor version and a list of operations.
#[derive(Clone, Debug, Default)]
pub struct COMPOUND4args {
    pub tag: String,
    pub minorversion: u32,
    pub argarray: Vec<nfs_argop4>,
}

impl Serialize for COMPOUND4args {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.tag.serialize(dest)?;
        self.minorversion.serialize(dest)?;
        (self.argarray.len() as u32).serialize(dest)?;
        for op in &self.argarray {
            op.serialize(dest)?;
        }
        Ok(())
    }
}

impl Deserialize for COMPOUND4args {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.tag.deserialize(src)?;
        self.minorversion.deserialize(src)?;
        let count = deserialize::<u32>(src)?;
        self.argarray.clear();
        for _ in 0..count {
            self.argarray.push(deserialize(src)?);
        }
        Ok(())
    }
}

/// Result of one COMPOUND operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum nfs_resop4 {
    RENEW(nfsstat4),
    SETCLIENTID(SETCLIENTID4res),
    SETCLIENTID_CONFIRM(nfsstat4),
}

impl nfs_resop4 {
    pub fn status(&self) -> nfsstat4 {
        match self {
            nfs_resop4::RENEW(stat) | nfs_resop4::SETCLIENTID_CONFIRM(stat) => *stat,
            nfs_resop4::SETCLIENTID(SETCLIENTID4res::Ok(_)) => nfsstat4::NFS4_OK,
            nfs_resop4::SETCLIENTID(SETCLIENTID4res::ClidInUse(_)) => {
                nfsstat4::NFS4ERR_CLID_INUSE
            }
            nfs_resop4::SETCLIENTID(SETCLIENTID4res::Err(stat)) => *stat,
        }
    }
}

impl Default for nfs_resop4 {
    fn default() -> Self {
        nfs_resop4::RENEW(nfsstat4::NFS4_OK)
    }
}

impl Serialize for nfs_resop4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            nfs_resop4::RENEW(stat) => {
                (nfs_opnum4::OP_RENEW as u32).serialize(dest)?;
                stat.serialize(dest)
            }
            nfs_resop4::SETCLIENTID(res) => {
                (nfs_opnum4::OP_SETCLIENTID as u32).serialize(dest)?;
                res.serialize(dest)
            }
            nfs_resop4::SETCLIENTID_CONFIRM(stat) => {
                (nfs_opnum4::OP_SETCLIENTID_CONFIRM as u32).serialize(dest)?;
                stat.serialize(dest)
            }
        }
    }
}

impl Deserialize for nfs_resop4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let op = deserialize::<u32>(src)?;
        *self = match nfs_opnum4::from_u32(op) {
            Some(nfs_opnum4::OP_RENEW) => nfs_resop4::RENEW(deserialize(src)?),
            Some(nfs_opnum4::OP_SETCLIENTID) => nfs_resop4::SETCLIENTID(deserialize(src)?),
            Some(nfs_opnum4::OP_SETCLIENTID_CONFIRM) => {
                nfs_resop4::SETCLIENTID_CONFIRM(deserialize(src)?)
            }
            None => return Err(invalid_data(&format!("Unsupported result operation {op}"))),
        };
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct COMPOUND4res {
    pub status: nfsstat4,
    pub tag: String,
    pub resarray: Vec<nfs_resop4>,
}

impl Serialize for COMPOUND4res {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.status.serialize(dest)?;
        self.tag.serialize(dest)?;
        (self.resarray.len() as u32).serialize(dest)?;
        for res in &self.resarray {
            res.serialize(dest)?;
        }
        Ok(())
    }
}

impl Deserialize for COMPOUND4res {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.status.deserialize(src)?;
        self.tag.deserialize(src)?;
        let count = deserialize::<u32>(src)?;
        self.resarray.clear();
        for _ in 0..count {
            self.resarray.push(deserialize(src)?);
        }
        Ok(())
    }
}

/// Attribute set: a bitmap of present attributes followed by their
/// values, packed in bit order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct fattr4 {
    pub attrmask: bitmap4,
    pub attr_vals: Vec<u8>,
}
DeserializeStruct!(fattr4, attrmask, attr_vals);
SerializeStruct!(fattr4, attrmask, attr_vals);

/// Tests bit `attr` of an attribute bitmap.
pub fn bitmap_has(bitmap: &[u32], attr: u32) -> bool {
    let word = (attr / 32) as usize;
    bitmap.get(word).is_some_and(|w| w & (1 << (attr % 32)) != 0)
}

/// Sets bit `attr` of an attribute bitmap, growing it as needed.
pub fn bitmap_set(bitmap: &mut bitmap4, attr: u32) {
    let word = (attr / 32) as usize;
    if bitmap.len() <= word {
        bitmap.resize(word + 1, 0);
    }
    bitmap[word] |= 1 << (attr % 32);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_GETATTR4args {
    pub fh: nfs_fh4,
    pub attr_request: bitmap4,
}
DeserializeStruct!(CB_GETATTR4args, fh, attr_request);
SerializeStruct!(CB_GETATTR4args, fh, attr_request);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_RECALL4args {
    pub stateid: stateid4,
    pub truncate: bool,
    pub fh: nfs_fh4,
}
DeserializeStruct!(CB_RECALL4args, stateid, truncate, fh);
SerializeStruct!(CB_RECALL4args, stateid, truncate, fh);

/// One operation of a CB_COMPOUND request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum nfs_cb_argop4 {
    CB_GETATTR(CB_GETATTR4args),
    CB_RECALL(CB_RECALL4args),
    /// Any operation number this client does not implement.
    CB_ILLEGAL(u32),
}

impl Default for nfs_cb_argop4 {
    fn default() -> Self {
        nfs_cb_argop4::CB_ILLEGAL(nfs_cb_opnum4::OP_CB_ILLEGAL as u32)
    }
}

impl Serialize for nfs_cb_argop4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            nfs_cb_argop4::CB_GETATTR(args) => {
                (nfs_cb_opnum4::OP_CB_GETATTR as u32).serialize(dest)?;
                args.serialize(dest)
            }
            nfs_cb_argop4::CB_RECALL(args) => {
                (nfs_cb_opnum4::OP_CB_RECALL as u32).serialize(dest)?;
                args.serialize(dest)
            }
            nfs_cb_argop4::CB_ILLEGAL(op) => op.serialize(dest),
        }
    }
}

impl Deserialize for nfs_cb_argop4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let op = deserialize::<u32>(src)?;
        *self = match nfs_cb_opnum4::from_u32(op) {
            Some(nfs_cb_opnum4::OP_CB_GETATTR) => nfs_cb_argop4::CB_GETATTR(deserialize(src)?),
            Some(nfs_cb_opnum4::OP_CB_RECALL) => nfs_cb_argop4::CB_RECALL(deserialize(src)?),
            _ => nfs_cb_argop4::CB_ILLEGAL(op),
        };
        Ok(())
    }
}

/// Fixed part of a CB_COMPOUND request. The operations follow and are
/// decoded one at a time so a malformed operation only loses the tail.
#[derive(Clone, Debug, Default)]
pub struct CB_COMPOUND4header {
    pub tag: String,
    pub minorversion: u32,
    pub callback_ident: u32,
    pub op_count: u32,
}
DeserializeStruct!(CB_COMPOUND4header, tag, minorversion, callback_ident, op_count);
SerializeStruct!(CB_COMPOUND4header, tag, minorversion, callback_ident, op_count);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum nfs_cb_resop4 {
    CB_GETATTR(nfsstat4, Option<fattr4>),
    CB_RECALL(nfsstat4),
    CB_ILLEGAL(nfsstat4),
}

impl nfs_cb_resop4 {
    pub fn status(&self) -> nfsstat4 {
        match self {
            nfs_cb_resop4::CB_GETATTR(stat, _)
            | nfs_cb_resop4::CB_RECALL(stat)
            | nfs_cb_resop4::CB_ILLEGAL(stat) => *stat,
        }
    }
}

impl Default for nfs_cb_resop4 {
    fn default() -> Self {
        nfs_cb_resop4::CB_ILLEGAL(nfsstat4::NFS4ERR_OP_ILLEGAL)
    }
}

impl Serialize for nfs_cb_resop4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            nfs_cb_resop4::CB_GETATTR(stat, attrs) => {
                (nfs_cb_opnum4::OP_CB_GETATTR as u32).serialize(dest)?;
                stat.serialize(dest)?;
                match (stat, attrs) {
                    (nfsstat4::NFS4_OK, Some(attrs)) => attrs.serialize(dest),
                    (nfsstat4::NFS4_OK, None) => {
                        Err(invalid_data("CB_GETATTR result without attributes"))
                    }
                    _ => Ok(()),
                }
            }
            nfs_cb_resop4::CB_RECALL(stat) => {
                (nfs_cb_opnum4::OP_CB_RECALL as u32).serialize(dest)?;
                stat.serialize(dest)
            }
            nfs_cb_resop4::CB_ILLEGAL(stat) => {
                (nfs_cb_opnum4::OP_CB_ILLEGAL as u32).serialize(dest)?;
                stat.serialize(dest)
            }
        }
    }
}

impl Deserialize for nfs_cb_resop4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let op = deserialize::<u32>(src)?;
        let stat = deserialize::<nfsstat4>(src)?;
        *self = match nfs_cb_opnum4::from_u32(op) {
            Some(nfs_cb_opnum4::OP_CB_GETATTR) => {
                let attrs = if stat == nfsstat4::NFS4_OK { Some(deserialize(src)?) } else { None };
                nfs_cb_resop4::CB_GETATTR(stat, attrs)
            }
            Some(nfs_cb_opnum4::OP_CB_RECALL) => nfs_cb_resop4::CB_RECALL(stat),
            _ => nfs_cb_resop4::CB_ILLEGAL(stat),
        };
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct CB_COMPOUND4res {
    pub status: nfsstat4,
    pub tag: String,
    pub resarray: Vec<nfs_cb_resop4>,
}

impl Serialize for CB_COMPOUND4res {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.status.serialize(dest)?;
        self.tag.serialize(dest)?;
        (self.resarray.len() as u32).serialize(dest)?;
        for res in &self.resarray {
            res.serialize(dest)?;
        }
        Ok(())
    }
}

impl Deserialize for CB_COMPOUND4res {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.status.deserialize(src)?;
        self.tag.deserialize(src)?;
        let count = deserialize::<u32>(src)?;
        self.resarray.clear();
        for _ in 0..count {
            self.resarray.push(deserialize(src)?);
        }
        Ok(())
    }
}
