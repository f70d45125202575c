//! Chunked reads from blocking sources
//!
//! [`ChunkReader`] pulls fixed-size chunks out of a blocking reader, running
//! every read on the client's dispatcher so the awaiting task never blocks.
//! Object bodies returned by
//! [`AsyncClient::stream_object`](crate::AsyncClient::stream_object) and the
//! file parts of a multipart upload are both read this way.

use crate::adapter::BlockingAdapter;
use crate::client::BodyReader;
use crate::error::BridgeError;
use bytes::Bytes;
use std::fmt;
use std::io::{self, Read};

/// Object body streamed through the dispatcher
pub type ObjectBody = ChunkReader<BodyReader>;

/// Sequential chunks of a blocking reader
pub struct ChunkReader<R> {
    adapter: BlockingAdapter,
    reader: Option<R>,
    chunk_size: usize,
}

impl<R> fmt::Debug for ChunkReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkReader")
            .field("mode", &self.adapter.mode())
            .field("chunk_size", &self.chunk_size)
            .field("finished", &self.reader.is_none())
            .finish()
    }
}

impl<R: Read + Send + 'static> ChunkReader<R> {
    /// A `chunk_size` of 0 yields everything left as a single chunk.
    pub fn new(adapter: BlockingAdapter, reader: R, chunk_size: usize) -> Self {
        Self {
            adapter,
            reader: Some(reader),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Next chunk, or `None` once the reader is exhausted.
    ///
    /// Every chunk is exactly `chunk_size` bytes except the last.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BridgeError> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(None);
        };

        let chunk_size = self.chunk_size;
        let (reader, chunk) = self
            .adapter
            .run(move || {
                let chunk = read_chunk(&mut reader, chunk_size);
                (reader, chunk)
            })
            .await?;

        let chunk = chunk?;
        if chunk.is_empty() {
            return Ok(None);
        }
        if chunk_size > 0 {
            self.reader = Some(reader);
        }
        Ok(Some(chunk))
    }

    /// Everything not read yet
    pub async fn read_to_end(&mut self) -> Result<Bytes, BridgeError> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(data))
    }
}

fn read_chunk<R: Read>(reader: &mut R, size: usize) -> io::Result<Bytes> {
    let mut buffer = Vec::new();
    if size == 0 {
        reader.read_to_end(&mut buffer)?;
    } else {
        buffer.reserve(size);
        reader.by_ref().take(size as u64).read_to_end(&mut buffer)?;
    }
    Ok(Bytes::from(buffer))
}
