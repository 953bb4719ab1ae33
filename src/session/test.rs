//! Test helpers for stream and session logic
// (c) 2024 Ross Younger

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use quinn_proto::{Dir, Side, StreamId};

use crate::protocol::{ErrorCode, Readable, StreamError, StreamTransport};

#[derive(Debug)]
#[allow(variant_size_differences)]
enum Inbound {
    Data(Bytes),
    Fin,
    Reset(u64),
}

#[derive(Debug, Default)]
struct MockStream {
    written: Vec<u8>,
    finished: bool,
    /// Bytes the stream will accept before blocking; `None` is unlimited
    credit: Option<usize>,
    peer_stopped: Option<u64>,
    reset: Option<ErrorCode>,
    stopped: Option<ErrorCode>,
    inbound: VecDeque<Inbound>,
    inbound_offset: u64,
}

/// A deterministic, in-memory [`StreamTransport`]
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    next_index: u64,
    refuse_open: bool,
    calls: usize,
    streams: BTreeMap<StreamId, MockStream>,
}

impl MockTransport {
    fn stream(&mut self, id: StreamId) -> &mut MockStream {
        self.streams.entry(id).or_default()
    }

    fn next_id(&mut self) -> StreamId {
        let id = StreamId::new(Side::Client, Dir::Bi, self.next_index);
        self.next_index += 1;
        let _ = self.stream(id);
        id
    }

    /// Opens a stream without going through the contract
    pub(crate) fn open_stream(&mut self) -> StreamId {
        self.next_id()
    }

    /// Simulates the peer opening a stream
    pub(crate) fn incoming_stream(&mut self) -> StreamId {
        self.next_id()
    }

    pub(crate) fn set_refuse_open(&mut self, refuse: bool) {
        self.refuse_open = refuse;
    }

    pub(crate) fn set_write_credit(&mut self, id: StreamId, credit: Option<usize>) {
        self.stream(id).credit = credit;
    }

    pub(crate) fn set_peer_stopped(&mut self, id: StreamId, code: u64) {
        self.stream(id).peer_stopped = Some(code);
    }

    pub(crate) fn push_inbound(&mut self, id: StreamId, data: &[u8]) {
        self.stream(id)
            .inbound
            .push_back(Inbound::Data(Bytes::copy_from_slice(data)));
    }

    pub(crate) fn push_fin(&mut self, id: StreamId) {
        self.stream(id).inbound.push_back(Inbound::Fin);
    }

    pub(crate) fn push_reset(&mut self, id: StreamId, code: u64) {
        self.stream(id).inbound.push_back(Inbound::Reset(code));
    }

    /// Everything the stream has consumed so far
    pub(crate) fn written(&self, id: StreamId) -> &[u8] {
        self.streams.get(&id).map_or(&[][..], |s| s.written.as_slice())
    }

    pub(crate) fn is_finished(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| s.finished)
    }

    pub(crate) fn reset_code(&self, id: StreamId) -> Option<ErrorCode> {
        self.streams.get(&id).and_then(|s| s.reset)
    }

    pub(crate) fn stop_code(&self, id: StreamId) -> Option<ErrorCode> {
        self.streams.get(&id).and_then(|s| s.stopped)
    }

    /// Number of calls made through the contract
    pub(crate) fn calls(&self) -> usize {
        self.calls
    }
}

impl StreamTransport for MockTransport {
    fn open_outgoing_stream(&mut self) -> Option<StreamId> {
        self.calls += 1;
        if self.refuse_open {
            None
        } else {
            Some(self.next_id())
        }
    }

    fn write(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, StreamError> {
        self.calls += 1;
        let stream = self.streams.get_mut(&id).ok_or(StreamError::Closed)?;
        if let Some(code) = stream.peer_stopped {
            return Err(StreamError::Stopped(code));
        }
        if stream.finished || stream.reset.is_some() {
            return Err(StreamError::Closed);
        }
        let n = stream.credit.map_or(data.len(), |c| c.min(data.len()));
        if let Some(c) = stream.credit.as_mut() {
            *c -= n;
        }
        stream.written.extend_from_slice(&data[..n]);
        if fin && n == data.len() {
            stream.finished = true;
        }
        Ok(n)
    }

    fn close_write_side(&mut self, id: StreamId, code: ErrorCode) {
        self.calls += 1;
        self.stream(id).reset = Some(code);
    }

    fn read(&mut self, id: StreamId, max: usize) -> Result<Readable, StreamError> {
        self.calls += 1;
        let stream = self.streams.get_mut(&id).ok_or(StreamError::Closed)?;
        if stream.stopped.is_some() {
            return Err(StreamError::Closed);
        }
        match stream.inbound.pop_front() {
            None => Ok(Readable::Blocked),
            Some(Inbound::Fin) => Ok(Readable::Finished),
            Some(Inbound::Reset(code)) => Err(StreamError::Reset(code)),
            Some(Inbound::Data(mut bytes)) => {
                if bytes.len() > max {
                    let rest = bytes.split_off(max);
                    stream.inbound.push_front(Inbound::Data(rest));
                }
                let offset = stream.inbound_offset;
                stream.inbound_offset += bytes.len() as u64;
                Ok(Readable::Data { offset, bytes })
            }
        }
    }

    fn stop_reading(&mut self, id: StreamId, code: ErrorCode) {
        self.calls += 1;
        self.stream(id).stopped = Some(code);
    }
}
