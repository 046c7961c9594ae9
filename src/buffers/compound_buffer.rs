//! Scatter-gather byte containers for the session transport. Their main purpose is to let the
//!  framing layer assemble and dissect messages without coalescing copies.
//!
//! Their salient points are:
//!
//! * composed of independently-owned chunks - a chunk is a [`Bytes`] handle, so backing storage
//!   is shared (reference-counted) with whoever produced the chunk
//! * structural operations (`append`, `prepend`, `slice`, `crop_front`, `crop_back`) move chunk
//!   handles around instead of bytes
//! * a one-way `lock()` that freezes the structure before it is handed to a consumer
//! * a cursor ([`ZeroCopyReader`]) that yields contiguous spans and implements [`Buf`], so
//!   parsers from the `bytes` ecosystem read straight across chunk boundaries
//!

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// An ordered sequence of shared byte chunks.
///
/// A producer builds the buffer chunk by chunk, locks it, and hands it to a consumer; once
///  locked, the structure is immutable and may be read any number of times (also concurrently -
///  all read access goes through `&self`). Mutating a locked buffer is a programming error and
///  asserts.
#[derive(Clone, Debug, Default)]
pub struct CompoundBuffer {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
    locked: bool,
}

impl CompoundBuffer {
    pub fn new() -> CompoundBuffer {
        CompoundBuffer::default()
    }

    /// The live sum of all chunk sizes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Freeze the buffer. There is deliberately no way back: consumers rely on a locked buffer
    ///  never changing underneath them.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Append a chunk, sharing its backing storage. Empty chunks are discarded - they would
    ///  contribute nothing and every reader would have to step over them.
    pub fn append(&mut self, chunk: Bytes) {
        self.assert_mutable();
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn prepend(&mut self, chunk: Bytes) {
        self.assert_mutable();
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_front(chunk);
    }

    /// Structural concatenation: `other`'s chunks are appended by cloning their handles, no
    ///  byte is copied.
    pub fn append_buffer(&mut self, other: &CompoundBuffer) {
        self.assert_mutable();
        for chunk in &other.chunks {
            self.chunks.push_back(chunk.clone());
        }
        self.total_bytes += other.total_bytes;
    }

    /// Copying variant of [`append`](Self::append) for transient data the caller does not keep
    ///  alive.
    pub fn append_copy_of(&mut self, data: &[u8]) {
        self.append(Bytes::copy_from_slice(data));
    }

    pub fn prepend_copy_of(&mut self, data: &[u8]) {
        self.prepend(Bytes::copy_from_slice(data));
    }

    /// Discard the first `count` bytes, dropping whole chunks where possible and narrowing the
    ///  chunk that straddles the new start.
    pub fn crop_front(&mut self, mut count: usize) {
        self.assert_mutable();
        assert!(count <= self.total_bytes, "cannot crop {} bytes off a buffer of {}", count, self.total_bytes);

        self.total_bytes -= count;
        while count > 0 {
            let front_len = self.chunks.front().expect("chunk accounting is inconsistent with total_bytes").len();
            if count >= front_len {
                self.chunks.pop_front();
                count -= front_len;
            }
            else {
                self.chunks.front_mut().unwrap().advance(count);
                count = 0;
            }
        }
    }

    /// Discard the last `count` bytes.
    pub fn crop_back(&mut self, mut count: usize) {
        self.assert_mutable();
        assert!(count <= self.total_bytes, "cannot crop {} bytes off a buffer of {}", count, self.total_bytes);

        self.total_bytes -= count;
        while count > 0 {
            let back_len = self.chunks.back().expect("chunk accounting is inconsistent with total_bytes").len();
            if count >= back_len {
                self.chunks.pop_back();
                count -= back_len;
            }
            else {
                let back = self.chunks.back_mut().unwrap();
                back.truncate(back_len - count);
                count = 0;
            }
        }
    }

    /// A new buffer referencing the byte range `[start, end)` of this one. A chunk that
    ///  straddles a requested boundary is referenced partially (via a sub-range handle), so the
    ///  boundaries need not align with chunk edges. The result is unlocked and shares all
    ///  backing storage with `self`.
    pub fn slice(&self, start: usize, end: usize) -> CompoundBuffer {
        assert!(start <= end && end <= self.total_bytes, "slice [{}, {}) out of range for buffer of {} bytes", start, end, self.total_bytes);

        let mut result = CompoundBuffer::new();
        let mut remaining_skip = start;
        let mut remaining_take = end - start;

        for chunk in &self.chunks {
            if remaining_take == 0 {
                break;
            }
            if remaining_skip >= chunk.len() {
                remaining_skip -= chunk.len();
                continue;
            }

            let take = (chunk.len() - remaining_skip).min(remaining_take);
            result.append(chunk.slice(remaining_skip..remaining_skip + take));
            remaining_skip = 0;
            remaining_take -= take;
        }

        result
    }

    /// Materialize the buffer's contents as one contiguous allocation. This is the copy the
    ///  rest of the API exists to avoid - for use at the few points that genuinely need
    ///  contiguous bytes.
    pub fn to_contiguous(&self) -> Bytes {
        let mut result = BytesMut::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            result.put_slice(chunk);
        }
        result.freeze()
    }

    /// Copy the buffer's contents into `dest`. Panics if `dest` has insufficient capacity.
    pub fn copy_into(&self, dest: &mut impl BufMut) {
        for chunk in &self.chunks {
            dest.put_slice(chunk);
        }
    }

    fn assert_mutable(&self) {
        assert!(!self.locked, "attempt to mutate a locked buffer");
    }
}

impl PartialEq for CompoundBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.total_bytes == other.total_bytes
            && self.chunks.iter().flat_map(|c| c.iter())
                .eq(other.chunks.iter().flat_map(|c| c.iter()))
    }
}
impl Eq for CompoundBuffer {}

/// A cursor over a locked [`CompoundBuffer`] that yields contiguous spans without copying.
///
/// [`next`](Self::next) returns the remainder of the current chunk; a consumer that needs a
///  logical value straddling a chunk boundary continues transparently into the next span (or
///  uses the [`Buf`] impl, which does exactly that). [`back_up`](Self::back_up) returns up to
///  the previous span's bytes to be re-read, for parsers that over-request.
pub struct ZeroCopyReader<'a> {
    buf: &'a CompoundBuffer,
    chunk_index: usize,
    offset_in_chunk: usize,
    consumed: usize,

    // the span handed out by the last next() call, for back_up()
    last_span_chunk: usize,
    last_span_start: usize,
    last_span_len: usize,
    backed_up: usize,
}

impl<'a> ZeroCopyReader<'a> {
    pub fn new(buf: &'a CompoundBuffer) -> ZeroCopyReader<'a> {
        assert!(buf.locked(), "a reader requires a locked buffer");
        ZeroCopyReader {
            buf,
            chunk_index: 0,
            offset_in_chunk: 0,
            consumed: 0,
            last_span_chunk: 0,
            last_span_start: 0,
            last_span_len: 0,
            backed_up: 0,
        }
    }

    /// The next contiguous span (the remainder of the current chunk), or `None` at the end of
    ///  the buffer. The returned span counts as consumed.
    pub fn next(&mut self) -> Option<&'a [u8]> {
        let chunk = self.buf.chunks.get(self.chunk_index)?;
        let span = &chunk[self.offset_in_chunk..];

        self.last_span_chunk = self.chunk_index;
        self.last_span_start = self.offset_in_chunk;
        self.last_span_len = span.len();
        self.backed_up = 0;

        self.consumed += span.len();
        self.chunk_index += 1;
        self.offset_in_chunk = 0;
        Some(span)
    }

    /// Return up to the previous span's bytes to be re-read. Only bytes of the span returned by
    ///  the most recent [`next`](Self::next) call can be returned; calling this after
    ///  [`skip`](Self::skip) or without a preceding `next` is a programming error.
    pub fn back_up(&mut self, count: usize) {
        assert!(self.backed_up + count <= self.last_span_len,
                "can back up at most the {} bytes returned by the last next() call", self.last_span_len);

        self.backed_up += count;
        self.consumed -= count;
        self.chunk_index = self.last_span_chunk;
        self.offset_in_chunk = self.last_span_start + (self.last_span_len - self.backed_up);

        // the position may coincide with the chunk's end (back_up(0), or re-reading nothing)
        self.normalize();
    }

    /// Advance without materializing data.
    pub fn skip(&mut self, mut count: usize) {
        assert!(count <= self.remaining(), "cannot skip {} bytes with {} remaining", count, self.remaining());

        self.consumed += count;
        self.last_span_len = 0;
        self.backed_up = 0;

        while count > 0 {
            let available = self.buf.chunks[self.chunk_index].len() - self.offset_in_chunk;
            if count >= available {
                count -= available;
                self.chunk_index += 1;
                self.offset_in_chunk = 0;
            }
            else {
                self.offset_in_chunk += count;
                count = 0;
            }
        }
        self.normalize();
    }

    pub fn bytes_consumed(&self) -> usize {
        self.consumed
    }

    /// keep the invariant that `offset_in_chunk` points strictly inside a chunk (or the reader
    ///  is positioned past the last chunk)
    fn normalize(&mut self) {
        while let Some(chunk) = self.buf.chunks.get(self.chunk_index) {
            if self.offset_in_chunk < chunk.len() {
                break;
            }
            self.offset_in_chunk -= chunk.len();
            self.chunk_index += 1;
        }
    }
}

impl Buf for ZeroCopyReader<'_> {
    fn remaining(&self) -> usize {
        self.buf.total_bytes() - self.consumed
    }

    fn chunk(&self) -> &[u8] {
        match self.buf.chunks.get(self.chunk_index) {
            Some(chunk) => &chunk[self.offset_in_chunk..],
            None => &[],
        }
    }

    fn advance(&mut self, cnt: usize) {
        self.skip(cnt);
    }
}
