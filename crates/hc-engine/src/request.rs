//! Reference-counted OSC requests and the client-to-audio queue.
//!
//! A request is decoded on the client thread when it is created; the audio
//! thread only walks the decoded packet. The handle is refcounted so the
//! scheduler can hold copies of a request past the block that drained it.
//! When the last handle drops, the storage is forwarded to the worker for
//! deallocation; the audio thread never frees packet memory.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_channel::Sender;
use hc_proto::{ErrorKind, RequestId};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rosc::OscPacket;

use crate::error::{EngineError, Result};
use crate::worker::Command;

struct RequestData {
    refs: AtomicUsize,
    id: RequestId,
    packet: OscPacket,
    size: usize,
}

/// Heap block of a fully-dropped request, on its way to the worker.
pub(crate) struct RequestStorage(NonNull<RequestData>);

unsafe impl Send for RequestStorage {}

impl RequestStorage {
    /// Drop the underlying block. Worker thread only.
    pub(crate) fn release(self) {
        unsafe { drop(Box::from_raw(self.0.as_ptr())) }
    }
}

/// Refcounted handle to one OSC request packet.
#[derive(Debug)]
pub struct Request {
    data: NonNull<RequestData>,
    free_queue: Sender<Command>,
}

unsafe impl Send for Request {}

impl Request {
    /// Decode `bytes` and wrap them. Runs on the sending (non-realtime)
    /// thread; this is the one place request storage is allocated.
    pub fn new(id: RequestId, bytes: &[u8], free_queue: Sender<Command>) -> Result<Self> {
        let (_, packet) = rosc::decoder::decode_udp(bytes)
            .map_err(|_| EngineError::with_message(ErrorKind::ArgumentRange, "malformed OSC packet"))?;
        let data = Box::new(RequestData {
            refs: AtomicUsize::new(1),
            id,
            packet,
            size: bytes.len(),
        });
        Ok(Self {
            data: NonNull::from(Box::leak(data)),
            free_queue,
        })
    }

    pub fn id(&self) -> RequestId {
        unsafe { self.data.as_ref().id }
    }

    pub fn packet(&self) -> &OscPacket {
        unsafe { &self.data.as_ref().packet }
    }

    /// Encoded size of the original packet in bytes.
    pub fn size(&self) -> usize {
        unsafe { self.data.as_ref().size }
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        unsafe { self.data.as_ref().refs.load(Ordering::Relaxed) }
    }
}

impl Clone for Request {
    fn clone(&self) -> Self {
        unsafe { self.data.as_ref().refs.fetch_add(1, Ordering::Relaxed) };
        Self {
            data: self.data,
            free_queue: self.free_queue.clone(),
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        let last = unsafe { self.data.as_ref().refs.fetch_sub(1, Ordering::Release) } == 1;
        if last {
            fence(Ordering::Acquire);
            let storage = RequestStorage(self.data);
            // Storage release always happens off the audio thread. If the
            // worker is gone (engine shutdown), free inline; no realtime
            // constraint applies at that point.
            if let Err(err) = self.free_queue.try_send(Command::FreeRequest(storage)) {
                match err.into_inner() {
                    Command::FreeRequest(storage) => storage.release(),
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// Audio-thread end of the request queue.
pub struct RequestQueue {
    cons: HeapCons<Request>,
}

impl RequestQueue {
    /// Pop the next pending request, if any.
    pub fn next(&mut self) -> Option<Request> {
        self.cons.try_pop()
    }
}

/// Client end of the request queue. The ring itself is single-producer;
/// the mutex serializes multiple client threads on the sending side.
pub struct RequestSender {
    prod: Mutex<HeapProd<Request>>,
}

impl RequestSender {
    /// Enqueue a request without blocking. A full queue is an error to the
    /// caller, never a stall.
    pub fn send(&self, request: Request) -> Result<()> {
        let mut prod = self.prod.lock().unwrap_or_else(|e| e.into_inner());
        prod.try_push(request)
            .map_err(|_| EngineError::with_message(ErrorKind::QueueOverflow, "request queue full"))
    }
}

/// Build a request queue of `capacity` slots.
pub fn request_queue(capacity: usize) -> (RequestSender, RequestQueue) {
    let (prod, cons) = HeapRb::<Request>::new(capacity).split();
    (RequestSender { prod: Mutex::new(prod) }, RequestQueue { cons })
}
