//! Growable machine-code buffer

/// Initial buffer capacity in bytes
pub const INITIAL_CAPACITY: usize = 4096;

/// Byte buffer that machine code is emitted into.
///
/// Every multi-byte value is appended one little-endian byte at a time.
/// When the buffer is full its capacity doubles.
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    /// Create a buffer with [`INITIAL_CAPACITY`]
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Create a buffer with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Bytes emitted so far
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been emitted
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Current capacity
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// Emitted bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the emitted bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn grow(&mut self) {
        let additional = self.bytes.capacity().max(1);
        self.bytes.reserve_exact(additional);
    }

    /// Append one byte
    pub fn emit_u8(&mut self, byte: u8) {
        if self.bytes.len() == self.bytes.capacity() {
            self.grow();
        }
        self.bytes.push(byte);
    }

    /// Append a sequence of bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.emit_u8(byte);
        }
    }

    /// Append a 16-bit value
    pub fn emit_u16(&mut self, value: u16) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Append a 32-bit value
    pub fn emit_u32(&mut self, value: u32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Append a signed 32-bit value
    pub fn emit_i32(&mut self, value: i32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Append a 64-bit value
    pub fn emit_u64(&mut self, value: u64) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Read back a 32-bit value
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.bytes.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite a 32-bit value; returns false if out of bounds
    pub fn patch_u32(&mut self, offset: usize, value: u32) -> bool {
        match self.bytes.get_mut(offset..offset + 4) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
