// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The single-writer frame serializer
//!
//! The flusher owns the outbound queue, is the only component that hands
//! bytes to the transport, and is the only mutator of send windows. Any
//! thread may kick it; the writer state machine guarantees at most one
//! thread drains the queue at a time, yielding while a transport write is
//! in flight and resuming from its completion.

use crate::{error::Error, session::Session, stream::Stream, sync::lock, task::Task};
use bytes::Bytes;
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};
use s2n_http2_core::{
    frame::{self, settings, Frame, FrameBytes, WindowUpdate},
    stream_error,
};
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
};

/// Cap on a single gathered write
const MAX_BATCH_BYTES: usize = 32 * 1024;

// Writer states. DIRTY variants record a kick that arrived while the writer
// was busy, so the draining thread re-checks the queue before going idle.
const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RUNNING_DIRTY: u8 = 2;
const WRITING: u8 = 3;
const WRITING_DIRTY: u8 = 4;
const TERMINATED: u8 = 5;

/// An entry awaiting emission
pub(crate) enum Entry {
    /// Any non-DATA frame; encoded once, emitted whole
    Control {
        frame: FrameBytes,
        /// The stream the post-write effect applies to (the promised
        /// stream for PUSH_PROMISE)
        stream: Option<Arc<Stream>>,
        task: Task,
    },

    /// A DATA frame, consumable in window-limited slices
    Data(DataEntry),

    /// Drain everything ahead, then close the transport
    Disconnect { task: Task },
}

pub(crate) struct DataEntry {
    pub stream: Arc<Stream>,
    pub data: Bytes,
    pub end_stream: bool,
    pub task: Task,
}

/// Window mutations deferred to the flush cycle, where the single writer
/// owns the arithmetic
pub(crate) enum Adjustment {
    /// An inbound WINDOW_UPDATE
    WindowUpdate {
        stream: Option<Arc<Stream>>,
        frame: WindowUpdate,
    },

    /// The peer changed SETTINGS_INITIAL_WINDOW_SIZE
    InitialWindow { new_initial: u32 },
}

/// What must happen after a frame's bytes reach the transport
enum Effect {
    None,
    HeadersSent {
        stream: Arc<Stream>,
        end_stream: bool,
    },
    RstSent {
        stream: Arc<Stream>,
    },
    PushPromiseSent {
        stream: Arc<Stream>,
    },
    GoAwaySent,
    WindowUpdateSent {
        stream: Option<Arc<Stream>>,
        increment: u32,
    },
    DataSent {
        stream: Arc<Stream>,
        len: u32,
        end_stream: bool,
    },
}

struct Written {
    effect: Effect,
    /// Present only for the slice that completes its entry
    task: Option<Task>,
}

/// The write submitted to the transport, with everything needed on
/// completion
pub(crate) struct Batch {
    written: Vec<Written>,
    disconnect: Option<Task>,
    len: usize,
}

enum Cycle {
    /// A write was handed to the transport; its completion resumes the loop
    Wrote,
    /// Nothing to do
    Empty,
    /// A DISCONNECT was reached with nothing left to write
    Disconnect(Task),
    Terminated,
}

struct Inner {
    queue: VecDeque<Entry>,
    /// Data entries parked on a zero window; retried after adjustments
    stalled: Vec<DataEntry>,
    adjustments: SmallVec<[Adjustment; 4]>,
}

pub(crate) struct Flusher {
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl Flusher {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                stalled: Vec::new(),
                adjustments: SmallVec::new(),
            }),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == TERMINATED
    }

    /// Appends an entry and kicks the writer
    pub fn submit(&self, session: &Arc<Session>, entry: Entry) -> Result<(), Error> {
        self.enqueue(session, entry, VecDeque::push_back)
    }

    /// Prepends an urgent control entry (PING) ahead of the backlog
    pub fn prepend(&self, session: &Arc<Session>, entry: Entry) -> Result<(), Error> {
        self.enqueue(session, entry, VecDeque::push_front)
    }

    fn enqueue(
        &self,
        session: &Arc<Session>,
        entry: Entry,
        push: fn(&mut VecDeque<Entry>, Entry),
    ) -> Result<(), Error> {
        let rejected = {
            let mut inner = lock(&self.inner);
            if self.is_terminated() {
                Some(entry)
            } else {
                push(&mut inner.queue, entry);
                None
            }
        };

        match rejected {
            Some(entry) => {
                fail_entry(entry, Error::Closed);
                Err(Error::Closed)
            }
            None => {
                self.kick(session);
                Ok(())
            }
        }
    }

    /// Runs `f` with exclusive access to the queue, then kicks the writer
    ///
    /// Stream-id allocation and the enqueue of the opening frame happen
    /// inside one such call, which is what keeps wire order aligned with id
    /// order across concurrent openers.
    pub fn with_queue<R>(
        &self,
        session: &Arc<Session>,
        f: impl FnOnce(&mut VecDeque<Entry>) -> R,
    ) -> Result<R, Error> {
        let result = {
            let mut inner = lock(&self.inner);
            if self.is_terminated() {
                return Err(Error::Closed);
            }
            f(&mut inner.queue)
        };
        self.kick(session);
        Ok(result)
    }

    /// Defers an inbound WINDOW_UPDATE to the flush cycle
    pub fn window(&self, session: &Arc<Session>, stream: Option<Arc<Stream>>, frame: WindowUpdate) {
        {
            let mut inner = lock(&self.inner);
            if self.is_terminated() {
                return;
            }
            inner.adjustments.push(Adjustment::WindowUpdate { stream, frame });
        }
        self.kick(session);
    }

    /// Defers a peer SETTINGS_INITIAL_WINDOW_SIZE change to the flush cycle
    pub fn initial_window(&self, session: &Arc<Session>, new_initial: u32) {
        {
            let mut inner = lock(&self.inner);
            if self.is_terminated() {
                return;
            }
            inner
                .adjustments
                .push(Adjustment::InitialWindow { new_initial });
        }
        self.kick(session);
    }

    /// Stops the writer and fails every queued entry
    pub fn terminate(&self, error: Error) {
        let entries = {
            let mut inner = lock(&self.inner);
            self.state.store(TERMINATED, Ordering::Release);
            inner.adjustments.clear();
            let mut entries: Vec<Entry> = inner.queue.drain(..).collect();
            entries.extend(inner.stalled.drain(..).map(Entry::Data));
            entries
        };

        for entry in entries {
            fail_entry(entry, error.clone());
        }
    }

    /// Wakes the writer; at most one caller wins the drain
    pub fn kick(&self, session: &Arc<Session>) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (current, next, run) = match state {
                IDLE => (IDLE, RUNNING, true),
                RUNNING => (RUNNING, RUNNING_DIRTY, false),
                WRITING => (WRITING, WRITING_DIRTY, false),
                _ => return,
            };
            if self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if run {
                    self.run(session);
                }
                return;
            }
        }
    }

    fn run(&self, session: &Arc<Session>) {
        loop {
            match self.cycle(session) {
                Cycle::Wrote | Cycle::Terminated => return,
                Cycle::Disconnect(task) => {
                    session.finish_disconnect(task);
                    return;
                }
                Cycle::Empty => {
                    if self.transition(RUNNING, IDLE) {
                        return;
                    }
                    if self.transition(RUNNING_DIRTY, RUNNING) {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    #[inline]
    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// One pass over adjustments and the queue, ending in at most one
    /// transport write
    fn cycle(&self, session: &Arc<Session>) -> Cycle {
        let mut connection_failure = None;
        let mut stream_failures: SmallVec<[(Arc<Stream>, s2n_http2_core::error::Error); 2]> =
            SmallVec::new();
        let mut failed_entries: Vec<(Task, Error)> = Vec::new();

        let mut bytes = Vec::new();
        let mut batch = Batch {
            written: Vec::new(),
            disconnect: None,
            len: 0,
        };

        {
            let mut inner = lock(&self.inner);
            if self.is_terminated() {
                return Cycle::Terminated;
            }

            // 1. apply deferred window mutations
            let adjustments = core::mem::take(&mut inner.adjustments);
            for adjustment in adjustments {
                match adjustment {
                    Adjustment::WindowUpdate { stream, frame } => {
                        match session
                            .flow()
                            .window_update(session, stream.as_deref(), &frame)
                        {
                            Ok(()) => {}
                            Err(error) if error.is_connection_error() => {
                                connection_failure = Some(error);
                                break;
                            }
                            Err(error) => {
                                if let Some(stream) = stream {
                                    stream_failures.push((stream, error));
                                }
                            }
                        }
                    }
                    Adjustment::InitialWindow { new_initial } => {
                        if let Err(error) = session
                            .flow()
                            .update_initial_stream_window(session, new_initial, false)
                        {
                            connection_failure = Some(error);
                            break;
                        }
                    }
                }
            }

            if connection_failure.is_none() {
                // retry parked data now that windows may have credit
                while let Some(entry) = inner.stalled.pop() {
                    inner.queue.push_front(Entry::Data(entry));
                }

                // 2/3. drain entries into one gathered write
                while let Some(entry) = inner.queue.pop_front() {
                    match entry {
                        Entry::Control {
                            frame,
                            stream,
                            task,
                        } => {
                            pre_write(session, &frame);
                            let effect = effect_for(&frame, &stream);
                            encode_frame(&mut bytes, &frame);
                            batch.written.push(Written {
                                effect,
                                task: Some(task),
                            });
                        }
                        Entry::Data(mut entry) => {
                            if entry.stream.is_reset() {
                                failed_entries.push((
                                    entry.task,
                                    Error::Protocol(stream_error!(
                                        STREAM_CLOSED,
                                        "stream reset before data was written"
                                    )),
                                ));
                                continue;
                            }

                            let remaining = entry.data.len();
                            let allowed = allowed_send(session, &entry.stream, remaining);
                            if allowed == 0 && remaining > 0 {
                                inner.stalled.push(entry);
                                continue;
                            }

                            let chunk = entry.data.split_to(allowed);
                            let end_stream = entry.end_stream && entry.data.is_empty();
                            let len = chunk.len() as u32;

                            session.flow().on_data_sending(session, &entry.stream, len);

                            let frame = frame::Data {
                                stream_id: entry.stream.id(),
                                end_stream,
                                padding: None,
                                data: chunk,
                            };
                            encode_frame(&mut bytes, &Frame::Data(frame));

                            // sole mutator of send windows
                            session.debit_send_window(len);
                            entry.stream.debit_send_window(len);

                            let effect = Effect::DataSent {
                                stream: entry.stream.clone(),
                                len,
                                end_stream,
                            };
                            if entry.data.is_empty() {
                                batch.written.push(Written {
                                    effect,
                                    task: Some(entry.task),
                                });
                            } else {
                                batch.written.push(Written { effect, task: None });
                                inner.queue.push_front(Entry::Data(entry));
                            }
                        }
                        Entry::Disconnect { task } => {
                            batch.disconnect = Some(task);
                            break;
                        }
                    }

                    if bytes.len() >= MAX_BATCH_BYTES {
                        break;
                    }
                }
            }
        }

        for (task, error) in failed_entries {
            task.complete(Err(error));
        }
        for (stream, error) in stream_failures {
            session.reset_stream_for_error(&stream, error);
        }
        if let Some(error) = connection_failure {
            // fail() enqueues the GOAWAY; the dirty mark keeps the loop
            // alive to flush it
            session.fail(error);
            return Cycle::Empty;
        }

        if bytes.is_empty() && batch.written.is_empty() {
            if let Some(task) = batch.disconnect {
                return Cycle::Disconnect(task);
            }
            return Cycle::Empty;
        }

        // enter the writing state before handing off so an inline
        // completion cannot race the state machine
        loop {
            if self.transition(RUNNING, WRITING) || self.transition(RUNNING_DIRTY, WRITING_DIRTY) {
                break;
            }
            if self.is_terminated() {
                for written in batch.written {
                    if let Some(task) = written.task {
                        task.complete(Err(Error::Closed));
                    }
                }
                if let Some(task) = batch.disconnect {
                    task.complete(Err(Error::Closed));
                }
                return Cycle::Terminated;
            }
        }

        batch.len = bytes.len();
        let data = Bytes::from(bytes);
        let completer = session.clone();
        session.transport().write(
            data,
            Box::new(move |result| {
                let flusher = completer.flusher();
                flusher.write_complete(&completer, result, batch);
            }),
        );

        Cycle::Wrote
    }

    /// Runs post-write effects and completions, then resumes draining
    pub(crate) fn write_complete(
        &self,
        session: &Arc<Session>,
        result: io::Result<()>,
        batch: Batch,
    ) {
        if let Err(error) = result {
            let error = Error::from(error);
            for written in batch.written {
                if let Some(task) = written.task {
                    task.complete(Err(error.clone()));
                }
            }
            if let Some(task) = batch.disconnect {
                task.complete(Err(error.clone()));
            }
            session.abort(error);
            return;
        }

        session.add_bytes_written(batch.len as u64);

        for written in batch.written {
            match written.effect {
                Effect::None => {}
                Effect::HeadersSent { stream, end_stream } => {
                    stream.on_headers_sent(end_stream);
                    if stream.is_closed() {
                        session.remove_stream(&stream);
                    }
                }
                Effect::RstSent { stream } => {
                    stream.on_reset();
                    session.remove_stream(&stream);
                }
                Effect::PushPromiseSent { stream } => {
                    stream.on_push_promise_sent();
                }
                Effect::GoAwaySent => {
                    session.transport().shutdown_output();
                }
                Effect::WindowUpdateSent { stream, increment } => {
                    session
                        .flow()
                        .on_window_update_sent(session, stream.as_deref(), increment);
                }
                Effect::DataSent {
                    stream,
                    len,
                    end_stream,
                } => {
                    session.flow().on_data_sent(session, &stream, len);
                    if end_stream {
                        stream.on_end_stream_sent();
                        if stream.is_closed() {
                            session.remove_stream(&stream);
                        }
                    }
                }
            }

            if let Some(task) = written.task {
                task.complete(Ok(()));
            }
        }

        if let Some(task) = batch.disconnect {
            session.finish_disconnect(task);
            return;
        }

        loop {
            if self.transition(WRITING, RUNNING) || self.transition(WRITING_DIRTY, RUNNING) {
                break;
            }
            // terminated while the write was in flight
            return;
        }
        self.run(session);
    }
}

fn fail_entry(entry: Entry, error: Error) {
    match entry {
        Entry::Control { task, .. } => task.complete(Err(error)),
        Entry::Data(entry) => entry.task.complete(Err(error)),
        Entry::Disconnect { task } => task.complete(Err(error)),
    }
}

/// How much of a data entry the windows and frame cap allow right now
fn allowed_send(session: &Session, stream: &Stream, remaining: usize) -> usize {
    let session_window = session.send_window().max(0) as usize;
    let stream_window = stream.send_window().max(0) as usize;
    let cap = session.max_frame_size() as usize;
    remaining.min(session_window).min(stream_window).min(cap)
}

/// Applies the local side of a SETTINGS frame atomically with its emission
fn pre_write(session: &Arc<Session>, frame: &FrameBytes) {
    if let Frame::Settings(frame) = frame {
        if frame.ack {
            return;
        }
        for setting in &frame.settings {
            if setting.id == settings::Id::INITIAL_WINDOW_SIZE {
                let _ = session
                    .flow()
                    .update_initial_stream_window(session, setting.value, true);
            }
        }
    }
}

fn effect_for(frame: &FrameBytes, stream: &Option<Arc<Stream>>) -> Effect {
    match frame {
        Frame::Headers(headers) => match stream {
            Some(stream) => Effect::HeadersSent {
                stream: stream.clone(),
                end_stream: headers.end_stream,
            },
            None => Effect::None,
        },
        Frame::RstStream(_) => match stream {
            Some(stream) => Effect::RstSent {
                stream: stream.clone(),
            },
            None => Effect::None,
        },
        Frame::PushPromise(_) => match stream {
            Some(stream) => Effect::PushPromiseSent {
                stream: stream.clone(),
            },
            None => Effect::None,
        },
        Frame::GoAway(_) => Effect::GoAwaySent,
        Frame::WindowUpdate(frame) => Effect::WindowUpdateSent {
            stream: stream.clone(),
            increment: frame.increment,
        },
        _ => Effect::None,
    }
}

fn encode_frame(bytes: &mut Vec<u8>, frame: &FrameBytes) {
    let size = frame.encoding_size();
    let start = bytes.len();
    bytes.resize(start + size, 0);
    let mut encoder = EncoderBuffer::new(&mut bytes[start..]);
    encoder.encode(frame);
    debug_assert_eq!(encoder.len(), size);
}
