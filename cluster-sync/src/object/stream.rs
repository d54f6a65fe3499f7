use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Byte sink handed to pack and instance-data callbacks.
#[derive(Debug, Default)]
pub struct DataOStream {
    buffer: Vec<u8>,
}

impl DataOStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        bincode::serialize_into(&mut self.buffer, value)?;
        Ok(())
    }

    /// False when the callback wrote nothing, i.e. there is nothing to send.
    pub fn has_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct DataIStream<'a> {
    data: &'a [u8],
}

impl<'a> DataIStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T> {
        Ok(bincode::deserialize_from(&mut self.data)?)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
