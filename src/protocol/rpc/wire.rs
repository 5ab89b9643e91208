//! Record Marking (RFC 5531 section 11) for RPC over stream transports.
//!
//! A record is sent as one or more fragments. Each fragment starts with a
//! 4-byte big-endian header: the high bit flags the last fragment of the
//! record, the low 31 bits hold the fragment length. Datagram transports
//! carry one record per packet and use none of this.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{RpcError, RpcResult};

/// Upper bound on a reassembled record accepted from a peer.
pub const MAX_RPC_RECORD_LENGTH: usize = 64 * 1024 * 1024;

/// Largest length a single fragment header can express.
pub const MAX_FRAGMENT_SIZE: usize = (1 << 31) - 1;

/// Largest RPC message carried by one UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

const LAST_FRAGMENT: u32 = 1 << 31;

/// Encodes a fragment header.
pub fn fragment_header(length: usize, is_last: bool) -> [u8; 4] {
    debug_assert!(length <= MAX_FRAGMENT_SIZE);
    let header = if is_last { length as u32 | LAST_FRAGMENT } else { length as u32 };
    header.to_be_bytes()
}

/// Splits a fragment header into its length and last-fragment flag.
pub fn parse_fragment_header(header: [u8; 4]) -> (usize, bool) {
    let header = u32::from_be_bytes(header);
    ((header & !LAST_FRAGMENT) as usize, header & LAST_FRAGMENT != 0)
}

/// A peer that goes away mid-record shows up as EOF; that is an aborted
/// connection, not a short message.
fn eof_is_abort(e: std::io::Error) -> RpcError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        RpcError::Aborted
    } else {
        RpcError::Io(e)
    }
}

/// Reads one fragment and appends its payload to `append_to`.
///
/// Returns true if this was the last fragment of the record.
pub async fn read_fragment<R: AsyncRead + Unpin>(
    src: &mut R,
    append_to: &mut Vec<u8>,
    max_record: usize,
) -> RpcResult<bool> {
    let mut header = [0_u8; 4];
    src.read_exact(&mut header).await.map_err(eof_is_abort)?;
    let (length, is_last) = parse_fragment_header(header);
    trace!("Reading fragment length:{}, last:{}", length, is_last);

    let total = append_to.len().saturating_add(length);
    if total > max_record {
        return Err(RpcError::RecordTooLarge { length: total, max: max_record });
    }
    append_to.try_reserve(length).map_err(|_| RpcError::OutOfMemory)?;

    let start = append_to.len();
    append_to.resize(start + length, 0);
    src.read_exact(&mut append_to[start..]).await.map_err(eof_is_abort)?;
    Ok(is_last)
}

/// Reads fragments until the one carrying the last-fragment bit and returns
/// the reassembled record.
pub async fn read_record<R: AsyncRead + Unpin>(
    src: &mut R,
    max_record: usize,
) -> RpcResult<Vec<u8>> {
    let mut record = Vec::new();
    while !read_fragment(src, &mut record, max_record).await? {}
    trace!("Reassembled record of {} bytes", record.len());
    Ok(record)
}

/// Writes `buf` as a record split into fragments of at most `max_fragment`
/// bytes. Exactly the final fragment carries the last-fragment bit; an empty
/// record is a single empty last fragment.
pub async fn write_record<W: AsyncWrite + Unpin>(
    dest: &mut W,
    buf: &[u8],
    max_fragment: usize,
) -> RpcResult<()> {
    let max_fragment = max_fragment.clamp(1, MAX_FRAGMENT_SIZE);
    let mut offset = 0;
    loop {
        let fragment_size = std::cmp::min(buf.len() - offset, max_fragment);
        let is_last = offset + fragment_size >= buf.len();

        trace!("Writing fragment length:{}, last:{}", fragment_size, is_last);
        dest.write_all(&fragment_header(fragment_size, is_last))
            .await
            .map_err(zero_write_is_abort)?;
        dest.write_all(&buf[offset..offset + fragment_size])
            .await
            .map_err(zero_write_is_abort)?;

        offset += fragment_size;
        if is_last {
            break;
        }
    }
    dest.flush().await.map_err(zero_write_is_abort)?;
    Ok(())
}

/// `write_all` reports a socket that accepts zero bytes as `WriteZero`; the
/// peer is gone.
fn zero_write_is_abort(e: std::io::Error) -> RpcError {
    if e.kind() == std::io::ErrorKind::WriteZero {
        RpcError::Aborted
    } else {
        RpcError::Io(e)
    }
}
