//! LZNT1: LZ77 over independent 4 KiB chunks.
//!
//! Each chunk starts with a 16-bit header: bits 0-11 hold the stored data
//! length minus one, bits 12-14 the signature `3`, bit 15 is set when the
//! data is compressed. Compressed data is a series of flag bytes, each
//! followed by up to eight tokens (bit clear: literal byte, bit set: 16-bit
//! back-reference). A zero header ends the stream.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FfuError;

const CHUNK_SIZE: usize = 4096;
const SIGNATURE: u16 = 0x3000;
const COMPRESSED_FLAG: u16 = 0x8000;
const MIN_MATCH: usize = 3;
const HASH_BITS: u32 = 12;

/// Bits used by the displacement field of a back-reference emitted at
/// `pos` bytes into the chunk. The length field gets the remaining bits.
fn offset_bits(pos: usize) -> u32 {
    let mut bits = 4;
    let mut p = pos - 1;
    while p >= 0x10 {
        bits += 1;
        p >>= 1;
    }
    bits
}

fn hash3(data: &[u8]) -> usize {
    let v = (data[0] as u32) << 16 | (data[1] as u32) << 8 | data[2] as u32;
    (v.wrapping_mul(2_654_435_761) >> (32 - HASH_BITS)) as usize
}

/// Compress `data` into an LZNT1 stream.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    for chunk in data.chunks(CHUNK_SIZE) {
        let packed = compress_chunk(chunk);
        if packed.len() < chunk.len() {
            let header = COMPRESSED_FLAG | SIGNATURE | (packed.len() - 1) as u16;
            out.extend_from_slice(&header.to_le_bytes());
            out.extend_from_slice(&packed);
        } else {
            let header = SIGNATURE | (chunk.len() - 1) as u16;
            out.extend_from_slice(&header.to_le_bytes());
            out.extend_from_slice(chunk);
        }
    }
    out
}

fn compress_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len());
    let mut table = vec![usize::MAX; 1 << HASH_BITS];

    let mut pos = 0;
    let mut flag_pos = 0;
    let mut flag_bit = 8;
    while pos < chunk.len() {
        if flag_bit == 8 {
            flag_pos = out.len();
            out.push(0);
            flag_bit = 0;
        }

        let (match_len, match_offset) = find_match(chunk, pos, &mut table);
        if match_len >= MIN_MATCH {
            let len_bits = 16 - offset_bits(pos);
            let token = ((match_offset - 1) << len_bits) | (match_len - MIN_MATCH);
            out.extend_from_slice(&(token as u16).to_le_bytes());
            out[flag_pos] |= 1 << flag_bit;
            for p in pos + 1..pos + match_len {
                if p + MIN_MATCH <= chunk.len() {
                    table[hash3(&chunk[p..])] = p;
                }
            }
            pos += match_len;
        } else {
            out.push(chunk[pos]);
            pos += 1;
        }
        flag_bit += 1;
    }
    out
}

/// Greedy single-candidate match at `pos`; records `pos` in the hash table.
fn find_match(chunk: &[u8], pos: usize, table: &mut [usize]) -> (usize, usize) {
    if pos + MIN_MATCH > chunk.len() {
        return (0, 0);
    }
    let slot = hash3(&chunk[pos..]);
    let candidate = table[slot];
    table[slot] = pos;
    if pos == 0 || candidate == usize::MAX {
        return (0, 0);
    }

    let off_bits = offset_bits(pos);
    let max_offset = 1usize << off_bits;
    let max_len = ((1usize << (16 - off_bits)) - 1 + MIN_MATCH).min(chunk.len() - pos);
    let offset = pos - candidate;
    if offset > max_offset {
        return (0, 0);
    }

    let mut len = 0;
    while len < max_len && chunk[candidate + len] == chunk[pos + len] {
        len += 1;
    }
    (len, offset)
}

/// Decompress an LZNT1 stream. Output stops at a zero chunk header, at the
/// end of `data`, or once `limit` bytes have been produced.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, FfuError> {
    // each chunk costs at least a header and expands to at most CHUNK_SIZE
    let mut out = Vec::with_capacity(limit.min((data.len() / 3 + 1) * CHUNK_SIZE));
    let mut pos = 0;
    while pos + 2 <= data.len() && out.len() < limit {
        let header = LittleEndian::read_u16(&data[pos..pos + 2]);
        pos += 2;
        if header == 0 {
            break;
        }
        if header & 0x7000 != SIGNATURE {
            return Err(corrupt(format!("bad chunk signature in header {header:#06x}")));
        }
        let len = (header & 0x0FFF) as usize + 1;
        if pos + len > data.len() {
            return Err(corrupt(format!(
                "chunk of {len} bytes at offset {pos} runs past the end of the stream"
            )));
        }
        let chunk = &data[pos..pos + len];
        if header & COMPRESSED_FLAG != 0 {
            decompress_chunk(chunk, &mut out)?;
        } else {
            out.extend_from_slice(chunk);
        }
        pos += len;
    }
    out.truncate(limit);
    Ok(out)
}

fn decompress_chunk(chunk: &[u8], out: &mut Vec<u8>) -> Result<(), FfuError> {
    let start = out.len();
    let mut i = 0;
    while i < chunk.len() {
        let flags = chunk[i];
        i += 1;
        for bit in 0..8 {
            if i >= chunk.len() {
                break;
            }
            if flags & (1 << bit) == 0 {
                out.push(chunk[i]);
                i += 1;
                continue;
            }

            if i + 2 > chunk.len() {
                return Err(corrupt("truncated back-reference".into()));
            }
            let token = LittleEndian::read_u16(&chunk[i..i + 2]) as usize;
            i += 2;
            let written = out.len() - start;
            if written == 0 {
                return Err(corrupt("back-reference at start of chunk".into()));
            }
            let len_bits = 16 - offset_bits(written);
            let offset = (token >> len_bits) + 1;
            let length = (token & ((1 << len_bits) - 1)) + MIN_MATCH;
            if offset > written {
                return Err(corrupt(format!(
                    "back-reference offset {offset} exceeds the {written} bytes decoded"
                )));
            }
            let from = out.len() - offset;
            for k in 0..length {
                let b = out[from + k];
                out.push(b);
            }
        }
    }
    if out.len() - start > CHUNK_SIZE {
        return Err(corrupt(format!(
            "chunk expanded to {} bytes",
            out.len() - start
        )));
    }
    Ok(())
}

fn corrupt(msg: String) -> FfuError {
    FfuError::Compression(format!("corrupt LZNT1 data: {msg}"))
}
