//! Transport layer for remote-desktop sessions: it reconstructs discrete structured messages
//!  from byte streams whose arrival is chunked arbitrarily by the underlying transports,
//!  multiplexes the logical streams of one session over those transports, and tracks
//!  per-channel and per-session lifecycle under asynchronous I/O.
//!
//! ## Design goals
//!
//! * The abstraction handed to the application is *typed messages* on *named channels* - not
//!   bytes, not sockets
//! * One session ([`Connection`](connection::Connection)) multiplexes a fixed set of logical
//!   channels, each mapped to exactly one transport stream:
//!   * `control` - session control directives
//!   * `event` - input events
//!   * `video` - legacy single-stream video
//!   * `video-rtp` / `video-rtcp` - unreliable streaming video plus its control flow. No
//!     retransmission: loss on these is visible to the consumer
//! * Correctness must not depend on read sizes aligning with message boundaries - a message
//!   split across any number of reads (one byte at a time included) decodes identically
//! * Received chunks are kept as shared, reference-counted blocks
//!   ([`CompoundBuffer`](buffers::compound_buffer::CompoundBuffer)); messages are parsed
//!   straight across chunk boundaries instead of being coalesced first
//! * Channel and session lifecycles are closed state machines with explicit transition
//!   functions - an illegal transition is rejected, never silently performed
//! * Partial failure does not corrupt in-flight data: a failing channel is torn down hard
//!   (continuing to parse a corrupted stream would misinterpret every subsequent byte), and
//!   the session reports exactly one terminal notification
//!
//! ## Wire format
//!
//! Each message on a reliable channel is one *frame*:
//!
//! ```ascii
//! 0: body length (u32 BE) - number of bytes following this prefix
//! 4: message kind (u8) - 0 control, 1 input event, 2 video packet
//! 5: kind-specific payload (varint-encoded fields)
//! ```
//!
//! A length prefix above the configured maximum (or of zero) means the stream is corrupted or
//!  hostile; decoding stops hard and the channel fails. Resynchronization within a stream is
//!  deliberately not attempted.
//!
//! ## Concurrency model
//!
//! Channel I/O runs on spawned pump tasks. Everything crossing from those tasks to the
//!  application - inbound chunks, decoded messages, state changes - is posted onto queues and
//!  consumed elsewhere, so application code never races in-flight channel I/O. The only shared
//!  state mutated from more than one call context is the per-channel write queue, guarded by a
//!  lock that is held for the queue mutation itself and never across a transport call.
//!
//! Within one channel, writes flush in enqueue order (partial transport writes preserve order)
//!  and reads reach the decoder in arrival order. Across channels there is no ordering
//!  guarantee of any kind.
//!
//! ## Error policy
//!
//! * transport errors are fatal to the owning channel, and to the session if the channel is
//!   required
//! * framing/decode errors are fatal to the channel - never silently dropped
//! * out-of-sequence lifecycle operations surface as failed transitions, not as panics
//! * a `close()` racing an in-flight operation always resolves as a successful close
//!
//! Retry and backoff belong to the session-establishment layer above; nothing here retries.
//!
//! ## Liveness
//!
//! Independent of the channels, a [`HeartbeatSender`](heartbeat::HeartbeatSender) periodically
//!  sends a signed stanza (`identity + " " + timestamp`, signed with the locally held host
//!  key) over a request/response channel, and the peer's response may direct a new interval
//!  for subsequent ticks.

pub mod buffers;
pub mod channel;
pub mod config;
pub mod connection;
pub mod frame_header;
pub mod heartbeat;
pub mod message_decoder;
pub mod message_reader;
pub mod message_writer;
pub mod safe_converter;
pub mod session_messages;
pub mod transport;

#[cfg(test)]
pub mod test_util;
