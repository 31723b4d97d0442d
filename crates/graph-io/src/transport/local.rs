//! In-process transport: every rank is an endpoint of one [`LocalWorld`].
//!
//! Requests are forwarded to a progress thread that matches sends with receives in issue order
//! per `(source, destination, tag)` channel and copies payloads into posted buffers. A send
//! completes once its payload has been copied, unless it fits under the eager limit, in which
//! case it completes as soon as it is queued. Both sides of a match must agree on element type
//! and byte length.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::{
    PendingRequest, Rank, Tag, Transport, TransportContext, TransportError, TransportResult,
};
use crate::error::{OpError, OpResult};
use crate::tensor::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ChannelKey {
    source: Rank,
    dest: Rank,
    tag: Tag,
}

struct QueuedSend {
    payload: Bytes,
    dtype: DType,
    done: Option<SyncSender<TransportResult<()>>>,
}

struct QueuedReceive {
    buffer: BytesMut,
    dtype: DType,
    done: SyncSender<TransportResult<BytesMut>>,
}

enum Event {
    Send {
        key: ChannelKey,
        message: QueuedSend,
        done: SyncSender<TransportResult<()>>,
    },
    Receive {
        key: ChannelKey,
        request: QueuedReceive,
    },
    Abort,
}

#[derive(Default)]
struct Channel {
    sends: VecDeque<QueuedSend>,
    receives: VecDeque<QueuedReceive>,
}

/// A fixed-size group of in-process ranks sharing one progress thread.
///
/// The progress thread stops once every endpoint is dropped or an [`AbortHandle`] fires;
/// requests still outstanding at that point fail with [`TransportError::Aborted`].
pub struct LocalWorld {
    endpoints: Vec<LocalTransport>,
}

impl LocalWorld {
    pub fn new(size: usize) -> OpResult<Self> {
        Self::with_eager_limit(size, 0)
    }

    /// Builds a world whose sends of at most `eager_limit` bytes complete without a matching
    /// receive.
    pub fn with_eager_limit(size: usize, eager_limit: usize) -> OpResult<Self> {
        if size == 0 {
            return Err(OpError::config("local world needs at least one rank"));
        }
        let (events, inbox) = mpsc::channel();
        thread::Builder::new()
            .name("graph-io-progress".to_string())
            .spawn(move || progress_loop(inbox, eager_limit))?;
        debug!(size, eager_limit, "started local transport world");

        let endpoints = (0..size)
            .map(|rank| LocalTransport {
                rank,
                size,
                events: events.clone(),
            })
            .collect();
        Ok(Self { endpoints })
    }

    pub fn size(&self) -> usize {
        self.endpoints.len()
    }

    /// Handle that tears the world down while endpoints are still alive.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            events: self.endpoints[0].events.clone(),
        }
    }

    pub fn into_endpoints(self) -> Vec<LocalTransport> {
        self.endpoints
    }

    /// One context per rank, indexed by rank.
    pub fn into_contexts(self) -> Vec<TransportContext> {
        self.endpoints
            .into_iter()
            .map(|endpoint| TransportContext::new(Arc::new(endpoint)))
            .collect()
    }
}

/// Stops the progress thread of a [`LocalWorld`], failing every pending request.
#[derive(Clone)]
pub struct AbortHandle {
    events: Sender<Event>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.events.send(Event::Abort);
    }
}

/// Endpoint of a [`LocalWorld`] for one rank.
pub struct LocalTransport {
    rank: Rank,
    size: usize,
    events: Sender<Event>,
}

impl LocalTransport {
    fn check_rank(&self, rank: Rank) -> TransportResult<()> {
        if rank >= self.size {
            return Err(TransportError::InvalidRank {
                rank,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn begin_send(
        &self,
        payload: Bytes,
        dtype: DType,
        dest: Rank,
        tag: Tag,
    ) -> TransportResult<Box<dyn PendingRequest<()>>> {
        self.check_rank(dest)?;
        let (done, completion) = mpsc::sync_channel(1);
        let key = ChannelKey {
            source: self.rank,
            dest,
            tag,
        };
        let message = QueuedSend {
            payload,
            dtype,
            done: None,
        };
        // A stopped progress thread drops `done`, which surfaces as an abort on wait.
        let _ = self.events.send(Event::Send { key, message, done });
        Ok(Box::new(LocalRequest {
            completion,
            peer: dest,
            tag,
        }))
    }

    fn begin_receive(
        &self,
        buffer: BytesMut,
        dtype: DType,
        source: Rank,
        tag: Tag,
    ) -> TransportResult<Box<dyn PendingRequest<BytesMut>>> {
        self.check_rank(source)?;
        let (done, completion) = mpsc::sync_channel(1);
        let key = ChannelKey {
            source,
            dest: self.rank,
            tag,
        };
        let request = QueuedReceive {
            buffer,
            dtype,
            done,
        };
        let _ = self.events.send(Event::Receive { key, request });
        Ok(Box::new(LocalRequest {
            completion,
            peer: source,
            tag,
        }))
    }
}

struct LocalRequest<T> {
    completion: Receiver<TransportResult<T>>,
    peer: Rank,
    tag: Tag,
}

impl<T: Send> PendingRequest<T> for LocalRequest<T> {
    fn wait(self: Box<Self>) -> TransportResult<T> {
        self.completion
            .recv()
            .unwrap_or(Err(TransportError::Aborted {
                peer: self.peer,
                tag: self.tag,
            }))
    }
}

fn progress_loop(inbox: Receiver<Event>, eager_limit: usize) {
    let mut channels: HashMap<ChannelKey, Channel> = HashMap::new();
    while let Ok(event) = inbox.recv() {
        let key = match event {
            Event::Send {
                key,
                mut message,
                done,
            } => {
                trace!(?key, bytes = message.payload.len(), "queued send");
                if message.payload.len() <= eager_limit {
                    let _ = done.send(Ok(()));
                } else {
                    message.done = Some(done);
                }
                channels.entry(key).or_default().sends.push_back(message);
                key
            }
            Event::Receive { key, request } => {
                trace!(?key, bytes = request.buffer.len(), "queued receive");
                channels
                    .entry(key)
                    .or_default()
                    .receives
                    .push_back(request);
                key
            }
            Event::Abort => {
                warn!("local transport aborted");
                break;
            }
        };

        if let Some(channel) = channels.get_mut(&key) {
            while !channel.sends.is_empty() && !channel.receives.is_empty() {
                if let (Some(send), Some(receive)) =
                    (channel.sends.pop_front(), channel.receives.pop_front())
                {
                    complete(key, send, receive);
                }
            }
            if channel.sends.is_empty() && channel.receives.is_empty() {
                channels.remove(&key);
            }
        }
    }
    let outstanding: usize = channels
        .values()
        .map(|channel| channel.sends.len() + channel.receives.len())
        .sum();
    debug!(outstanding, "local transport progress thread exiting");
}

fn check_match(
    key: ChannelKey,
    send: &QueuedSend,
    receive: &QueuedReceive,
) -> TransportResult<()> {
    if send.dtype != receive.dtype {
        return Err(TransportError::TypeMismatch {
            tag: key.tag,
            expected: receive.dtype,
            found: send.dtype,
        });
    }
    if send.payload.len() != receive.buffer.len() {
        return Err(TransportError::SizeMismatch {
            tag: key.tag,
            expected: receive.buffer.len(),
            actual: send.payload.len(),
        });
    }
    Ok(())
}

fn complete(key: ChannelKey, send: QueuedSend, mut receive: QueuedReceive) {
    if let Err(err) = check_match(key, &send, &receive) {
        debug!(?key, %err, "failing mismatched transfer");
        if let Some(done) = send.done {
            let _ = done.send(Err(err.clone()));
        }
        let _ = receive.done.send(Err(err));
        return;
    }
    receive.buffer.copy_from_slice(&send.payload);
    trace!(?key, bytes = send.payload.len(), "matched transfer");
    if let Some(done) = send.done {
        let _ = done.send(Ok(()));
    }
    let _ = receive.done.send(Ok(receive.buffer));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(eager_limit: usize) -> (LocalTransport, LocalTransport) {
        let mut endpoints = LocalWorld::with_eager_limit(2, eager_limit)
            .unwrap()
            .into_endpoints();
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();
        (a, b)
    }

    #[test]
    fn receive_posted_before_send_is_filled() {
        let (a, b) = pair(0);
        let recv = b.begin_receive(BytesMut::zeroed(3), DType::U8, 0, 4).unwrap();
        let send = a.begin_send(Bytes::from_static(b"abc"), DType::U8, 1, 4).unwrap();
        assert_eq!(&recv.wait().unwrap()[..], b"abc");
        send.wait().unwrap();
    }

    #[test]
    fn messages_on_one_channel_arrive_in_order() {
        let (a, b) = pair(16);
        for payload in [b"1", b"2"] {
            a.begin_send(Bytes::from_static(payload), DType::I8, 1, 0)
                .unwrap()
                .wait()
                .unwrap();
        }
        let first = b.begin_receive(BytesMut::zeroed(1), DType::I8, 0, 0).unwrap();
        let second = b.begin_receive(BytesMut::zeroed(1), DType::I8, 0, 0).unwrap();
        assert_eq!(&second.wait().unwrap()[..], b"2");
        assert_eq!(&first.wait().unwrap()[..], b"1");
    }

    #[test]
    fn tags_separate_channels() {
        let (a, b) = pair(16);
        let _x = a.begin_send(Bytes::from_static(b"x"), DType::U8, 1, 1).unwrap();
        let _y = a.begin_send(Bytes::from_static(b"y"), DType::U8, 1, 2).unwrap();
        let y = b.begin_receive(BytesMut::zeroed(1), DType::U8, 0, 2).unwrap();
        assert_eq!(&y.wait().unwrap()[..], b"y");
    }

    #[test]
    fn size_mismatch_fails_both_sides() {
        let (a, b) = pair(0);
        let send = a.begin_send(Bytes::from_static(b"abcd"), DType::U8, 1, 9).unwrap();
        let recv = b.begin_receive(BytesMut::zeroed(2), DType::U8, 0, 9).unwrap();
        assert!(matches!(
            recv.wait(),
            Err(TransportError::SizeMismatch {
                expected: 2,
                actual: 4,
                ..
            })
        ));
        assert!(matches!(send.wait(), Err(TransportError::SizeMismatch { .. })));
    }

    #[test]
    fn element_type_mismatch_fails_both_sides() {
        let (a, b) = pair(0);
        let send = a.begin_send(Bytes::from(vec![0u8; 16]), DType::F64, 1, 2).unwrap();
        let recv = b.begin_receive(BytesMut::zeroed(16), DType::I64, 0, 2).unwrap();
        let expected = TransportError::TypeMismatch {
            tag: 2,
            expected: DType::I64,
            found: DType::F64,
        };
        assert_eq!(recv.wait().unwrap_err(), expected);
        assert_eq!(send.wait().unwrap_err(), expected);
    }

    #[test]
    fn dropping_the_world_aborts_outstanding_requests() {
        let (a, b) = pair(0);
        let recv = b.begin_receive(BytesMut::zeroed(8), DType::U64, 0, 1).unwrap();
        drop(a);
        drop(b);
        assert_eq!(
            recv.wait().unwrap_err(),
            TransportError::Aborted { peer: 0, tag: 1 }
        );
    }

    #[test]
    fn abort_handle_fails_pending_and_later_requests() {
        let world = LocalWorld::new(2).unwrap();
        let abort = world.abort_handle();
        let mut endpoints = world.into_endpoints();
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();

        let pending = b.begin_receive(BytesMut::zeroed(4), DType::F32, 0, 0).unwrap();
        abort.abort();
        assert!(matches!(
            pending.wait(),
            Err(TransportError::Aborted { peer: 0, tag: 0 })
        ));
        let late = a.begin_send(Bytes::from(vec![0u8; 4]), DType::F32, 1, 0).unwrap();
        assert!(matches!(late.wait(), Err(TransportError::Aborted { peer: 1, .. })));
    }

    #[test]
    fn invalid_ranks_are_rejected() {
        let endpoint = LocalWorld::new(1).unwrap().into_endpoints().remove(0);
        assert!(matches!(
            endpoint.begin_send(Bytes::new(), DType::U8, 3, 0).err(),
            Some(TransportError::InvalidRank { rank: 3, size: 1 })
        ));
        assert!(LocalWorld::new(0).is_err());
    }
}
