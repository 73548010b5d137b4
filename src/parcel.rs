use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::Error;

/// A flat binder payload under construction or inspection: bytes, the
/// offsets of embedded binder objects within them, and the accounted
/// size of out-of-line buffers that ride along in scatter-gather
/// transactions.
pub struct Parcel {
    cursor: Cursor<Vec<u8>>,
    object_offsets: Vec<usize>,
    buffers_size: usize,
}

impl std::fmt::Debug for Parcel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parcel")
            .field("data", &self.cursor.get_ref())
            .field("offsets", &self.object_offsets)
            .field("buffers_size", &self.buffers_size)
            .finish()
    }
}

impl Parcel {
    /// Create a new empty parcel.
    pub fn empty() -> Self {
        Self {
            cursor: Cursor::new(vec![]),
            object_offsets: vec![],
            buffers_size: 0,
        }
    }

    /// Create a parcel holding a copy of the given bytes.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            cursor: Cursor::new(data.to_vec()),
            object_offsets: vec![],
            buffers_size: 0,
        }
    }

    pub fn reset(&mut self) {
        self.cursor.set_position(0);
        self.cursor.get_mut().clear();
        self.object_offsets.clear();
        self.buffers_size = 0;
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn set_position(&mut self, pos: u64) {
        self.cursor.set_position(pos)
    }

    /// Retrieve the data of the parcel as a slice
    pub fn to_slice(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    /// Retrieve the size of the parcel's data
    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    /// Check if this parcel is empty.
    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    /// Retrieve the object offsets
    pub fn offsets(&self) -> &[usize] {
        &self.object_offsets
    }

    pub fn offsets_len(&self) -> usize {
        self.object_offsets.len()
    }

    /// Record the current position as the location of an embedded binder
    /// object.
    pub fn push_object(&mut self) {
        self.object_offsets.push(self.cursor.position() as usize);
    }

    /// Account an out-of-line buffer of `len` bytes. The driver expects
    /// scatter-gather totals rounded up to 8-byte granules.
    pub fn add_buffer(&mut self, len: usize) {
        self.buffers_size += (len + 7) & !7;
    }

    /// Total accounted size of out-of-line buffers; non-zero selects the
    /// scatter-gather transaction variant.
    pub fn buffers_size(&self) -> usize {
        self.buffers_size
    }

    /// Check if the parcel has unread data
    pub fn has_unread_data(&self) -> bool {
        self.cursor.position() != self.len() as u64
    }

    /// Write an i32 to the parcel
    pub fn write_i32(&mut self, data: i32) -> Result<(), Error> {
        self.cursor.write_i32::<LittleEndian>(data)?;
        Ok(())
    }

    /// Write an u32 to the parcel
    pub fn write_u32(&mut self, data: u32) -> Result<(), Error> {
        self.cursor.write_u32::<LittleEndian>(data)?;
        Ok(())
    }

    /// Write an u64 to the parcel
    pub fn write_u64(&mut self, data: u64) -> Result<(), Error> {
        self.cursor.write_u64::<LittleEndian>(data)?;
        Ok(())
    }

    /// Write a slice of data to the parcel, padded to 4-byte alignment
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let padded_len = (data.len() + 3) & !3;
        self.cursor.write_all(data)?;
        for _ in data.len()..padded_len {
            self.cursor.write_u8(0)?;
        }
        Ok(())
    }

    /// Read an i32 from the parcel
    pub fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(self.cursor.read_i32::<LittleEndian>()?)
    }

    /// Read an u32 from the parcel
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(self.cursor.read_u32::<LittleEndian>()?)
    }

    /// Read an u64 from the parcel
    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(self.cursor.read_u64::<LittleEndian>()?)
    }

    /// Read size bytes from the parcel, consuming the alignment padding
    pub fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        let padded = (size + 3) & !3;
        let mut data = vec![0u8; padded];
        self.cursor.read_exact(&mut data)?;
        data.truncate(size);
        Ok(data)
    }

    /// Write a length-prefixed UTF-16 string to the parcel
    pub fn write_str16(&mut self, string: &str) -> Result<(), Error> {
        let chars: Vec<u16> = string.encode_utf16().collect();
        self.write_i32(chars.len() as i32)?;
        let mut s16: Vec<u8> = vec![];
        for c in &chars {
            s16.write_u16::<LittleEndian>(*c)?;
        }
        s16.write_u16::<LittleEndian>(0)?;
        self.write(&s16)
    }

    /// Read a length-prefixed UTF-16 string from the parcel
    pub fn read_str16(&mut self) -> Result<String, Error> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok("".to_string());
        }
        let raw = self.read((len as usize + 1) * 2)?;
        let u16_array: Vec<u16> = raw[..len as usize * 2]
            .chunks_exact(2)
            .map(|a| u16::from_le_bytes([a[0], a[1]]))
            .collect();
        Ok(String::from_utf16(&u16_array)?)
    }

    /// Write a NUL-terminated 8-bit string, without a length prefix
    pub fn write_cstr8(&mut self, string: &str) -> Result<(), Error> {
        let mut s8 = string.as_bytes().to_vec();
        s8.push(0);
        self.write(&s8)
    }

    /// Read a NUL-terminated 8-bit string written by `write_cstr8`
    pub fn read_cstr8(&mut self) -> Result<String, Error> {
        let bytes = self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        let nul = bytes[start..]
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::Deserialization)?;
        let raw = self.read(nul + 1)?;
        Ok(String::from_utf8(raw[..nul].to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut parcel = Parcel::empty();
        parcel.write_i32(-42).unwrap();
        parcel.write_u32(0xdead_beef).unwrap();
        parcel.write_u64(1 << 40).unwrap();
        parcel.set_position(0);
        assert_eq!(parcel.read_i32().unwrap(), -42);
        assert_eq!(parcel.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(parcel.read_u64().unwrap(), 1 << 40);
        assert!(!parcel.has_unread_data());
    }

    #[test]
    fn writes_are_padded_to_words() {
        let mut parcel = Parcel::empty();
        parcel.write(&[1, 2, 3]).unwrap();
        assert_eq!(parcel.len(), 4);
        parcel.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(parcel.len(), 8);
    }

    #[test]
    fn str16_round_trip() {
        let mut parcel = Parcel::empty();
        parcel.write_str16("android.os.IServiceManager").unwrap();
        parcel.set_position(0);
        assert_eq!(parcel.read_str16().unwrap(), "android.os.IServiceManager");
    }

    #[test]
    fn cstr8_round_trip() {
        let mut parcel = Parcel::empty();
        parcel.write_cstr8("android.hidl.base@1.0::IBase").unwrap();
        assert_eq!(parcel.len() % 4, 0);
        parcel.set_position(0);
        assert_eq!(parcel.read_cstr8().unwrap(), "android.hidl.base@1.0::IBase");
    }

    #[test]
    fn buffer_accounting_rounds_up() {
        let mut parcel = Parcel::empty();
        assert_eq!(parcel.buffers_size(), 0);
        parcel.add_buffer(3);
        parcel.add_buffer(16);
        assert_eq!(parcel.buffers_size(), 24);
    }

    #[test]
    fn object_offsets_track_positions() {
        let mut parcel = Parcel::empty();
        parcel.write_u32(0).unwrap();
        parcel.push_object();
        parcel.write_u64(0).unwrap();
        parcel.write_u64(0).unwrap();
        parcel.push_object();
        assert_eq!(parcel.offsets(), &[4, 20]);
    }
}
