//! # Assembly Buffer
//!
//! Collects the binary audio frames of the request currently in flight.
//! Frames are kept exactly as they arrived; nothing is decoded until the
//! request's `done` frame says the audio is complete.
//!
//! ## Key Properties:
//! - **Append-only** while a request is active
//! - **Order-preserving**: chunks are concatenated in arrival order
//! - **Reset on request boundaries**: cleared whenever the active request changes

/// Ordered list of binary chunks belonging to the active request.
///
/// ## Memory Management:
/// Chunks are stored individually and only joined once, in [`AssemblyBuffer::take`],
/// so appending a frame never copies the audio received so far.
#[derive(Debug, Default)]
pub struct AssemblyBuffer {
    /// Raw frames in arrival order
    chunks: Vec<Vec<u8>>,

    /// Sum of all chunk lengths, kept so `len()` is O(1)
    total_bytes: usize,
}

impl AssemblyBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one binary frame verbatim.
    ///
    /// Empty frames are accepted and simply contribute nothing.
    pub fn push(&mut self, chunk: Vec<u8>) {
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
    }

    /// Total number of bytes received for the active request.
    pub fn len(&self) -> usize {
        self.total_bytes
    }

    /// Check if no audio has been received yet.
    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    /// Number of frames received so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Clear all audio data from the buffer.
    ///
    /// ## Usage:
    /// Called when a new request becomes active, and when a request is
    /// abandoned (timeout, disconnect, close).
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    /// Join every chunk into one contiguous buffer and leave the buffer empty.
    ///
    /// ## Returns:
    /// A `Vec<u8>` whose length is exactly the sum of the chunk lengths.
    /// A single chunk is moved out without copying.
    pub fn take(&mut self) -> Vec<u8> {
        let total = self.total_bytes;
        self.total_bytes = 0;

        let mut chunks = std::mem::take(&mut self.chunks);
        if chunks.len() == 1 {
            return chunks.pop().unwrap_or_default();
        }

        let mut assembled = Vec::with_capacity(total);
        for chunk in chunks {
            assembled.extend_from_slice(&chunk);
        }
        assembled
    }
}
