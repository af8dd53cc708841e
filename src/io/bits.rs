use crate::core::error::{Error, ErrorKind, Result};
use crate::io::file::FileHandle;

const FILE_SINK_FLUSH_SIZE: usize = 4096;
pub const LARGE_BIT_BUFFER_SIZE: usize = 65536;

/// Append-only bit stream. Bits accumulate in memory; when backed by a
/// file the buffer is appended to the file as it fills and on `sync`.
pub struct OBitStream {
    data: Vec<u8>,
    byte: u8,
    bit: u8,
    bit_count: u64,
    sink: Option<FileHandle>,
}

impl Default for OBitStream {
    fn default() -> Self {
        OBitStream::new()
    }
}

impl OBitStream {
    pub fn new() -> Self {
        OBitStream {
            data: Vec::new(),
            byte: 0,
            bit: 0,
            bit_count: 0,
            sink: None,
        }
    }

    /// Stream appending to `file`. The caller is expected to record the
    /// file offset before the first write; `sync` flushes the tail.
    pub fn with_file(file: FileHandle) -> Self {
        OBitStream {
            data: Vec::with_capacity(FILE_SINK_FLUSH_SIZE),
            byte: 0,
            bit: 0,
            bit_count: 0,
            sink: Some(file),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.byte = 0;
        self.bit = 0;
        self.bit_count = 0;
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<()> {
        self.byte <<= 1;
        if bit {
            self.byte |= 1;
        }
        self.bit += 1;
        self.bit_count += 1;
        if self.bit == 8 {
            self.data.push(self.byte);
            self.byte = 0;
            self.bit = 0;
            if self.sink.is_some() && self.data.len() >= FILE_SINK_FLUSH_SIZE {
                self.flush_to_sink()?;
            }
        }
        Ok(())
    }

    /// Write the low `bits` bits of `value`, most significant first.
    pub fn write_binary(&mut self, bits: u32, value: u32) -> Result<()> {
        debug_assert!(bits <= 32);
        for i in (0..bits).rev() {
            self.write_bit(value >> i & 1 == 1)?;
        }
        Ok(())
    }

    /// Elias-γ code for `value` ≥ 1: ⌊log₂ v⌋ zeros followed by the
    /// binary representation of v.
    pub fn write_gamma(&mut self, value: u32) -> Result<()> {
        if value == 0 {
            return Err(Error::new(ErrorKind::Overflow, "gamma code requires value >= 1"));
        }
        let n = 32 - value.leading_zeros();
        for _ in 1..n {
            self.write_bit(false)?;
        }
        self.write_binary(n, value)
    }

    /// Append all bits of `other` (a memory-backed stream) preserving
    /// bit order and length.
    pub fn copy_bits(&mut self, other: &OBitStream) -> Result<()> {
        debug_assert!(other.sink.is_none());
        let mut remaining = other.bit_count;
        for &byte in &other.data {
            let take = remaining.min(8) as u32;
            self.write_binary(take, (byte >> (8 - take)) as u32)?;
            remaining -= take as u64;
            if remaining == 0 {
                break;
            }
        }
        if remaining > 0 {
            // tail bits still sitting in the partial byte
            let tail = (other.byte as u32) & ((1 << other.bit) - 1);
            self.write_binary(remaining as u32, tail >> (other.bit as u64 - remaining))?;
        }
        Ok(())
    }

    /// Self-delimiting embedding of `other`: γ(bit count + 1), then the bits.
    pub fn write_bits(&mut self, other: &OBitStream) -> Result<()> {
        self.write_gamma(other.bit_count as u32 + 1)?;
        self.copy_bits(other)
    }

    /// Pad to a byte boundary and flush to the sink if file-backed.
    pub fn sync(&mut self) -> Result<()> {
        while self.bit != 0 {
            self.write_bit(false)?;
        }
        if self.sink.is_some() {
            self.flush_to_sink()?;
        }
        Ok(())
    }

    /// Byte content of a synced, memory-backed stream.
    pub fn bytes(&self) -> &[u8] {
        debug_assert_eq!(self.bit, 0);
        &self.data
    }

    fn flush_to_sink(&mut self) -> Result<()> {
        if let Some(file) = &self.sink {
            if !self.data.is_empty() {
                file.append(&self.data)?;
                self.data.clear();
            }
        }
        Ok(())
    }
}

/// Store a strictly increasing u32 sequence as γ(len+1) plus γ deltas.
pub fn write_array(bits: &mut OBitStream, values: &[u32]) -> Result<()> {
    bits.write_gamma(values.len() as u32 + 1)?;
    let mut prev = 0u32;
    for &v in values {
        bits.write_gamma(v - prev)?;
        prev = v;
    }
    Ok(())
}

pub fn read_array(bits: &mut IBitStream) -> Result<Vec<u32>> {
    let count = bits.read_gamma()? - 1;
    let mut values = Vec::with_capacity(count as usize);
    let mut prev = 0u32;
    for _ in 0..count {
        prev += bits.read_gamma()?;
        values.push(prev);
    }
    Ok(values)
}

enum BitSource {
    Memory(Vec<u8>),
    File {
        file: FileHandle,
        next_offset: u64,
        buffer: Vec<u8>,
        buffer_size: usize,
    },
}

/// Lazily reading bit stream over a byte buffer or a file region.
pub struct IBitStream {
    source: BitSource,
    pos: usize,
    byte: u8,
    bits_left: u8,
}

impl IBitStream {
    pub fn from_vec(data: Vec<u8>) -> Self {
        IBitStream {
            source: BitSource::Memory(data),
            pos: 0,
            byte: 0,
            bits_left: 0,
        }
    }

    /// Reader over the bits previously written to a synced memory stream.
    pub fn from_obits(bits: &OBitStream) -> Self {
        IBitStream::from_vec(bits.bytes().to_vec())
    }

    /// Buffered sequential reader starting at `offset`; reads to the end
    /// of the file in `buffer_size` chunks.
    pub fn from_file(file: FileHandle, offset: u64, buffer_size: usize) -> Self {
        IBitStream {
            source: BitSource::File {
                file,
                next_offset: offset,
                buffer: Vec::new(),
                buffer_size,
            },
            pos: 0,
            byte: 0,
            bits_left: 0,
        }
    }

    fn next_byte(&mut self) -> Result<u8> {
        match &mut self.source {
            BitSource::Memory(data) => {
                if self.pos >= data.len() {
                    return Err(Error::new(ErrorKind::EndOfStream, "bit stream exhausted"));
                }
                let b = data[self.pos];
                self.pos += 1;
                Ok(b)
            }
            BitSource::File { file, next_offset, buffer, buffer_size } => {
                if self.pos >= buffer.len() {
                    buffer.resize(*buffer_size, 0);
                    let read = file.pread_some(buffer, *next_offset)?;
                    buffer.truncate(read);
                    *next_offset += read as u64;
                    self.pos = 0;
                    if read == 0 {
                        return Err(Error::new(ErrorKind::EndOfStream, "bit stream exhausted"));
                    }
                }
                let b = buffer[self.pos];
                self.pos += 1;
                Ok(b)
            }
        }
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        if self.bits_left == 0 {
            self.byte = self.next_byte()?;
            self.bits_left = 8;
        }
        self.bits_left -= 1;
        Ok(self.byte >> self.bits_left & 1 == 1)
    }

    pub fn read_binary(&mut self, bits: u32) -> Result<u32> {
        debug_assert!(bits <= 32);
        let mut value = 0u32;
        for _ in 0..bits {
            value = value << 1 | self.read_bit()? as u32;
        }
        Ok(value)
    }

    pub fn read_gamma(&mut self) -> Result<u32> {
        let mut zeros = 0u32;
        while !self.read_bit()? {
            zeros += 1;
            if zeros > 31 {
                return Err(Error::new(ErrorKind::Corrupt, "gamma code too long"));
            }
        }
        let rest = self.read_binary(zeros)?;
        Ok(1 << zeros | rest)
    }

    /// Inverse of `OBitStream::write_bits`.
    pub fn read_bits(&mut self) -> Result<OBitStream> {
        let count = self.read_gamma()? - 1;
        let mut out = OBitStream::new();
        for _ in 0..count {
            let bit = self.read_bit()?;
            out.write_bit(bit)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::file::OpenMode;
    use rand::{Rng, SeedableRng};

    #[test]
    fn gamma_round_trip() {
        let mut out = OBitStream::new();
        let values = [1u32, 2, 3, 7, 8, 255, 256, 65535, 1 << 20, u32::MAX];
        for &v in &values {
            out.write_gamma(v).unwrap();
        }
        out.sync().unwrap();

        let mut input = IBitStream::from_obits(&out);
        for &v in &values {
            assert_eq!(input.read_gamma().unwrap(), v);
        }
        assert!(input.read_gamma().is_err());
    }

    #[test]
    fn gamma_rejects_zero() {
        let mut out = OBitStream::new();
        assert!(out.write_gamma(0).is_err());
    }

    #[test]
    fn gamma_bit_length() {
        // 1 + 2·⌊log₂ n⌋ bits
        for (v, expected) in [(1u32, 1u64), (2, 3), (4, 5), (255, 15), (256, 17)] {
            let mut out = OBitStream::new();
            out.write_gamma(v).unwrap();
            assert_eq!(out.bit_count(), expected);
        }
    }

    #[test]
    fn binary_and_mixed() {
        let mut out = OBitStream::new();
        out.write_binary(8, 0xA5).unwrap();
        out.write_gamma(1000).unwrap();
        out.write_binary(3, 5).unwrap();
        out.sync().unwrap();

        let mut input = IBitStream::from_obits(&out);
        assert_eq!(input.read_binary(8).unwrap(), 0xA5);
        assert_eq!(input.read_gamma().unwrap(), 1000);
        assert_eq!(input.read_binary(3).unwrap(), 5);
    }

    #[test]
    fn array_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut values = Vec::new();
        let mut v = 0u32;
        for _ in 0..200 {
            v += rng.gen_range(1..100);
            values.push(v);
        }

        let mut out = OBitStream::new();
        write_array(&mut out, &values).unwrap();
        out.sync().unwrap();

        let mut input = IBitStream::from_obits(&out);
        assert_eq!(read_array(&mut input).unwrap(), values);
    }

    #[test]
    fn embedded_bits_round_trip() {
        let mut idl = OBitStream::new();
        write_array(&mut idl, &[3, 9, 12]).unwrap();

        let mut out = OBitStream::new();
        out.write_gamma(42).unwrap();
        out.write_bits(&idl).unwrap();
        out.write_gamma(43).unwrap();
        out.sync().unwrap();

        let mut input = IBitStream::from_obits(&out);
        assert_eq!(input.read_gamma().unwrap(), 42);
        let mut embedded = input.read_bits().unwrap();
        embedded.sync().unwrap();
        let mut idl_in = IBitStream::from_obits(&embedded);
        assert_eq!(read_array(&mut idl_in).unwrap(), vec![3, 9, 12]);
        assert_eq!(input.read_gamma().unwrap(), 43);
    }

    #[test]
    fn file_backed_stream() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileHandle::open(dir.path().join("bits"), OpenMode::ReadWrite).unwrap();

        let mut out = OBitStream::with_file(file.clone());
        for v in 1..=5000u32 {
            out.write_gamma(v).unwrap();
        }
        out.sync().unwrap();

        let mut input = IBitStream::from_file(file, 0, 512);
        for v in 1..=5000u32 {
            assert_eq!(input.read_gamma().unwrap(), v);
        }
    }
}
