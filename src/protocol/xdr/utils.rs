use std::io::{Read, Write};

/// XDR items are padded to a multiple of four bytes.
const BLOCK: usize = 4;

const ZEROES: [u8; BLOCK] = [0; BLOCK];

fn pad_len(len: usize) -> usize {
    (BLOCK - len % BLOCK) % BLOCK
}

/// Consumes the zero padding that follows `len` bytes of opaque data.
pub fn read_padding(len: usize, src: &mut impl Read) -> std::io::Result<()> {
    let mut pad = [0_u8; BLOCK];
    src.read_exact(&mut pad[..pad_len(len)])
}

/// Emits the zero padding that follows `len` bytes of opaque data.
pub fn write_padding(len: usize, dest: &mut impl Write) -> std::io::Result<()> {
    dest.write_all(&ZEROES[..pad_len(len)])
}

pub fn invalid_data(m: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m)
}
