// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection-level session engine
//!
//! One [`Session`] per connection. Decoded frames enter through
//! [`Session::on_frame`] (parser thread), submissions enter through the
//! outbound API (any thread), and everything leaving the connection is
//! serialized by the flusher. The session owns the stream registry and the
//! close state machine; streams and the flusher hold no owning references
//! back, so teardown is a single authoritative sweep.

pub mod close;
pub mod policy;

#[cfg(test)]
mod tests;

pub use close::CloseState;
pub use policy::{ClientPolicy, HeadersPolicy, StreamFactory, SymmetricPolicy};

use crate::{
    codec::{EncoderControl, NoopEncoderControl},
    config::Config,
    error::Error,
    event::{Event, Notifier, SessionListener},
    flow_control::{FlowController, Simple},
    flusher::{DataEntry, Entry, Flusher},
    scheduler::{Scheduler, Timer},
    session::{close::CloseCell, policy::DefaultStreamFactory},
    stream::{
        map::{InsertError, StreamMap},
        Stream,
    },
    sync::lock,
    task::Task,
    transport::Transport,
};
use bytes::Bytes;
use core::time::Duration;
use s2n_http2_core::{
    connection_error, endpoint,
    error as frame_error,
    error::ErrorCode,
    frame::{
        settings, Data, Frame, FrameHeader, FrameMut, GoAway, Headers, Ping, Priority,
        PushPromise, RstStream, Settings, WindowUpdate,
    },
    stream::{id::MAX_STREAM_ID, StreamId},
    stream_error, window,
};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Instant,
};

/// GOAWAY reasons are truncated to this many UTF-8 octets
const GOAWAY_REASON_LIMIT: usize = 32;

pub struct Builder {
    local: endpoint::Type,
    config: Config,
    flow: Arc<dyn FlowController>,
    policy: Arc<dyn HeadersPolicy>,
    factory: Arc<dyn StreamFactory>,
    encoder: Arc<dyn EncoderControl>,
}

impl Builder {
    pub fn new(local: endpoint::Type, config: Config) -> Self {
        let policy: Arc<dyn HeadersPolicy> = match local {
            endpoint::Type::Client => Arc::new(ClientPolicy),
            endpoint::Type::Server => Arc::new(SymmetricPolicy),
        };

        Self {
            local,
            config,
            flow: Arc::new(Simple),
            policy,
            factory: Arc::new(DefaultStreamFactory),
            encoder: Arc::new(NoopEncoderControl),
        }
    }

    pub fn with_flow_controller(mut self, flow: Arc<dyn FlowController>) -> Self {
        self.flow = flow;
        self
    }

    pub fn with_headers_policy(mut self, policy: Arc<dyn HeadersPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stream_factory(mut self, factory: Arc<dyn StreamFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_encoder_control(mut self, encoder: Arc<dyn EncoderControl>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn build(
        self,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        listener: Box<dyn SessionListener>,
    ) -> Arc<Session> {
        let initial_local_id = StreamId::initial(self.local).as_u32();

        let session = Arc::new(Session {
            local: self.local,
            transport,
            scheduler,
            flow: self.flow,
            policy: self.policy,
            factory: self.factory,
            encoder: self.encoder,
            notifier: Notifier::new(listener),
            flusher: Flusher::new(),
            streams: StreamMap::new(),
            next_local_stream_id: AtomicU64::new(u64::from(initial_local_id)),
            last_remote_stream_id: AtomicU32::new(0),
            max_local_streams: AtomicI64::new(crate::config::UNLIMITED_STREAMS),
            send_window: AtomicI32::new(window::INITIAL_WINDOW_SIZE),
            recv_window: AtomicI32::new(window::INITIAL_WINDOW_SIZE),
            pending_refund: AtomicU32::new(0),
            local_initial_window: AtomicI32::new(self.config.initial_window_size as i32),
            remote_initial_window: AtomicI32::new(window::INITIAL_WINDOW_SIZE),
            max_frame_size: AtomicU32::new(settings::DEFAULT_MAX_FRAME_SIZE),
            push_enabled: AtomicBool::new(true),
            close_state: CloseCell::new(),
            terminated: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            session_timer: Mutex::new(None),
            config: self.config,
        });

        session.start();
        session
    }
}

pub struct Session {
    config: Config,
    local: endpoint::Type,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    flow: Arc<dyn FlowController>,
    policy: Arc<dyn HeadersPolicy>,
    factory: Arc<dyn StreamFactory>,
    encoder: Arc<dyn EncoderControl>,
    notifier: Notifier,
    flusher: Flusher,

    streams: StreamMap,
    next_local_stream_id: AtomicU64,
    last_remote_stream_id: AtomicU32,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS; -1 until announced
    max_local_streams: AtomicI64,

    /// Session send credit; mutated only by the flusher
    send_window: AtomicI32,
    /// Session receive credit; debited on the parser thread, credited as
    /// WINDOW_UPDATE frames go out
    recv_window: AtomicI32,
    /// Session-scope refund scratch for the flow-control strategy
    pending_refund: AtomicU32,

    /// Our SETTINGS_INITIAL_WINDOW_SIZE, seeding stream receive windows
    local_initial_window: AtomicI32,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE, seeding stream send windows
    remote_initial_window: AtomicI32,
    /// Peer's SETTINGS_MAX_FRAME_SIZE, capping outbound frames
    max_frame_size: AtomicU32,
    /// Peer's SETTINGS_ENABLE_PUSH
    push_enabled: AtomicBool,

    close_state: CloseCell,
    terminated: AtomicBool,
    bytes_written: AtomicU64,

    epoch: Instant,
    last_activity: AtomicU64,
    session_timer: Mutex<Option<Box<dyn Timer>>>,
}

impl Session {
    pub fn builder(local: endpoint::Type, config: Config) -> Builder {
        Builder::new(local, config)
    }

    fn start(self: &Arc<Self>) {
        if let Some(timeout) = self.config.session_idle_timeout {
            self.schedule_session_idle(timeout, timeout);
        }
    }

    // ===== accessors =====

    #[inline]
    pub fn local(&self) -> endpoint::Type {
        self.local
    }

    #[inline]
    pub fn close_state(&self) -> CloseState {
        self.close_state.load()
    }

    #[inline]
    pub fn send_window(&self) -> i32 {
        self.send_window.load(Ordering::Acquire)
    }

    #[inline]
    pub fn recv_window(&self) -> i32 {
        self.recv_window.load(Ordering::Acquire)
    }

    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    #[inline]
    pub fn local_stream_count(&self) -> i64 {
        self.streams.local_count()
    }

    #[inline]
    pub fn remote_stream_count(&self) -> i64 {
        self.streams.remote_count()
    }

    #[inline]
    pub fn last_remote_stream_id(&self) -> StreamId {
        StreamId::new_truncated(self.last_remote_stream_id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn push_enabled(&self) -> bool {
        self.push_enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.get(id)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn local_initial_window(&self) -> i32 {
        self.local_initial_window.load(Ordering::Acquire)
    }

    #[inline]
    pub fn remote_initial_window(&self) -> i32 {
        self.remote_initial_window.load(Ordering::Acquire)
    }

    pub fn for_each_stream(&self, f: impl FnMut(&Arc<Stream>)) {
        self.streams.for_each(f);
    }

    // ===== inbound dispatch =====

    /// Handles one decoded frame from the parser
    ///
    /// A connection-scoped error has already failed the session when this
    /// returns `Err`; the parser should stop feeding frames.
    pub fn on_frame(self: &Arc<Self>, frame: FrameMut<'_>) -> Result<(), Error> {
        self.not_idle();

        let result = match frame.into_owned() {
            Frame::Data(frame) => self.on_data(frame),
            Frame::Headers(frame) => self.on_headers(frame),
            Frame::Priority(frame) => self.on_priority(frame),
            Frame::RstStream(frame) => self.on_rst_stream(frame),
            Frame::Settings(frame) => self.on_settings(frame),
            Frame::PushPromise(frame) => self.on_push_promise(frame),
            Frame::Ping(frame) => self.on_ping(frame),
            Frame::GoAway(frame) => self.on_go_away(frame),
            Frame::WindowUpdate(frame) => self.on_window_update(frame),
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                debug_assert!(error.is_connection_error());
                self.fail(error);
                Err(Error::Protocol(error))
            }
        }
    }

    /// Handles a frame type the parser did not recognize
    ///
    /// With no upgrade in progress an unknown top-level frame is a
    /// connection error.
    pub fn on_unknown_frame(self: &Arc<Self>, header: FrameHeader) -> Result<(), Error> {
        tracing::debug!(frame_type = header.frame_type, "unknown frame type");
        let error = connection_error!(PROTOCOL_ERROR, "unknown_frame_type");
        self.fail(error);
        Err(Error::Protocol(error))
    }

    /// The peer shut down its sending direction (FIN) or the read side
    /// finished
    pub fn on_input_shutdown(self: &Arc<Self>) {
        match self.close_state.load() {
            CloseState::NotClosed => self.abort(Error::Disconnected),
            CloseState::LocallyClosed => {
                let _ = self.flusher.submit(
                    self,
                    Entry::Disconnect {
                        task: Task::noop(),
                    },
                );
            }
            // the DISCONNECT enqueued on GOAWAY receipt performs the close
            CloseState::RemotelyClosed | CloseState::Closed => {}
        }
    }

    /// The transport failed while reading
    pub fn on_transport_error(self: &Arc<Self>, error: io::Error) {
        self.abort(Error::from(error));
    }

    fn on_data(self: &Arc<Self>, frame: Data<Bytes>) -> Result<(), frame_error::Error> {
        let size = frame.flow_controlled_size() as u32;
        let stream = self.streams.get(frame.stream_id);

        // the session window is debited even when the stream is gone;
        // resets racing in-flight data must not desynchronize the windows
        match self.flow.on_data_received(self, stream.as_ref(), size) {
            Ok(()) => {}
            Err(error) if error.is_connection_error() => return Err(error),
            Err(error) => {
                // the stream overshot its window; the dropped octets still
                // count at session scope until refunded
                self.flow.on_data_dropped(self, size);
                if let Some(stream) = &stream {
                    self.reset_stream_for_error(stream, error);
                }
                return Ok(());
            }
        }

        let Some(stream) = stream else {
            self.flow.on_data_dropped(self, size);
            return Ok(());
        };

        stream.not_idle(self.now_nanos());

        if let Err(error) = stream.on_data_received(frame.end_stream) {
            // the data will never reach the application
            self.flow.on_data_dropped(self, size);
            self.reset_stream_for_error(&stream, error);
            return Ok(());
        }

        let end_stream = frame.end_stream;
        self.notify(Event::Data {
            stream: stream.clone(),
            data: frame.data,
            end_stream,
        });

        if end_stream && stream.is_closed() {
            self.remove_stream(&stream);
        }

        Ok(())
    }

    fn on_headers(self: &Arc<Self>, frame: Headers<Bytes>) -> Result<(), frame_error::Error> {
        let id = frame.stream_id;
        if id.is_connection() {
            return Err(connection_error!(PROTOCOL_ERROR, "headers on stream zero"));
        }

        if let Some(stream) = self.streams.get(id) {
            return self.deliver_headers(&stream, frame, false);
        }

        if id.initiator() == self.local {
            // a reply for a stream this side already tore down
            tracing::debug!(stream = id.as_u32(), "headers for an unknown local stream");
            return Ok(());
        }

        match self.create_remote_stream(id, false)? {
            Some(stream) => self.deliver_headers(&stream, frame, true),
            None => Ok(()),
        }
    }

    fn deliver_headers(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        frame: Headers<Bytes>,
        new_stream: bool,
    ) -> Result<(), frame_error::Error> {
        stream.not_idle(self.now_nanos());

        if let Err(error) = stream.on_headers_received(frame.end_stream) {
            if error.is_connection_error() {
                return Err(error);
            }
            self.reset_stream_for_error(stream, error);
            return Ok(());
        }

        if let Err(error) = self.policy.on_headers(self, stream, &frame) {
            if error.is_connection_error() {
                return Err(error);
            }
            self.reset_stream_for_error(stream, error);
            return Ok(());
        }

        if new_stream {
            self.notify(Event::NewStream {
                stream: stream.clone(),
            });
        }

        self.notify(Event::Headers {
            stream: stream.clone(),
            frame,
        });

        if stream.is_closed() {
            self.remove_stream(stream);
        }

        Ok(())
    }

    /// Registers a peer-initiated stream, enforcing the preconditions the
    /// role policies rely on
    ///
    /// `promised` marks streams reserved by PUSH_PROMISE, which bypass the
    /// headers policy: the promise itself is the authorization.
    fn create_remote_stream(
        self: &Arc<Self>,
        id: StreamId,
        promised: bool,
    ) -> Result<Option<Arc<Stream>>, frame_error::Error> {
        //= https://www.rfc-editor.org/rfc/rfc7540#section-5.1.1
        //# The identifier of a newly established stream MUST be numerically
        //# greater than all streams that the initiating endpoint has opened
        //# or reserved.  [...] An endpoint that receives an unexpected
        //# stream identifier MUST respond with a connection error
        //# (Section 5.4.1) of type PROTOCOL_ERROR.
        let last = self.last_remote_stream_id.load(Ordering::Acquire);
        if id.as_u32() <= last {
            return Err(connection_error!(
                PROTOCOL_ERROR,
                "remote stream id is not increasing"
            ));
        }
        self.last_remote_stream_id
            .fetch_max(id.as_u32(), Ordering::AcqRel);

        if self.close_state.load() != CloseState::NotClosed {
            // a GOAWAY already announced that no new streams are accepted
            self.send_reset(id, ErrorCode::REFUSED_STREAM);
            return Ok(None);
        }

        if !promised {
            if let Err(error) = self.policy.accept_remote_stream(self, id) {
                if error.is_connection_error() {
                    return Err(error);
                }
                self.send_reset(id, error.code);
                return Ok(None);
            }
        }

        let stream = self.factory.create(
            id,
            false,
            self.remote_initial_window(),
            self.local_initial_window(),
        );

        match self
            .streams
            .insert(stream.clone(), self.config.max_remote_streams)
        {
            Ok(()) => {}
            Err(InsertError::AtCapacity) => {
                //= https://www.rfc-editor.org/rfc/rfc7540#section-5.1.2
                //# An endpoint that receives a HEADERS frame that causes its
                //# advertised concurrent stream limit to be exceeded MUST treat
                //# this as a stream error (Section 5.4.2) of type PROTOCOL_ERROR
                //# or REFUSED_STREAM.
                self.send_reset(id, ErrorCode::REFUSED_STREAM);
                return Ok(None);
            }
            Err(InsertError::Duplicate) => {
                return Err(connection_error!(PROTOCOL_ERROR, "duplicate stream id"));
            }
        }

        self.flow.on_stream_created(&stream);
        self.start_stream_idle_timer(&stream);

        Ok(Some(stream))
    }

    fn on_priority(&self, frame: Priority) -> Result<(), frame_error::Error> {
        // the parser validated the frame; prioritization itself is advisory
        tracing::trace!(stream = frame.stream_id.as_u32(), "priority");
        Ok(())
    }

    fn on_rst_stream(self: &Arc<Self>, frame: RstStream) -> Result<(), frame_error::Error> {
        if let Some(stream) = self.streams.get(frame.stream_id) {
            stream.on_reset();
            self.remove_stream(&stream);
        }

        self.notify(Event::Reset {
            stream_id: frame.stream_id,
            error_code: frame.error_code,
            local: false,
        });

        Ok(())
    }

    fn on_settings(self: &Arc<Self>, frame: Settings) -> Result<(), frame_error::Error> {
        if frame.ack {
            // the local values were applied when the frame's bytes left
            tracing::debug!("settings acknowledged by the peer");
            return Ok(());
        }

        for setting in &frame.settings {
            setting.validate()?;
        }

        for setting in &frame.settings {
            match setting.id {
                settings::Id::HEADER_TABLE_SIZE => {
                    self.encoder.set_header_table_size(setting.value);
                }
                settings::Id::ENABLE_PUSH => {
                    self.push_enabled.store(setting.value == 1, Ordering::Release);
                }
                settings::Id::MAX_CONCURRENT_STREAMS => {
                    self.max_local_streams
                        .store(i64::from(setting.value), Ordering::Release);
                }
                settings::Id::INITIAL_WINDOW_SIZE => {
                    // send windows belong to the flusher
                    self.flusher.initial_window(self, setting.value);
                }
                settings::Id::MAX_FRAME_SIZE => {
                    self.max_frame_size.store(setting.value, Ordering::Release);
                    self.encoder.set_max_frame_size(setting.value);
                }
                settings::Id::MAX_HEADER_LIST_SIZE => {
                    self.encoder.set_max_header_list_size(setting.value);
                }
                _ => {
                    //= https://www.rfc-editor.org/rfc/rfc7540#section-6.5.2
                    //# An endpoint that receives a SETTINGS frame with any unknown
                    //# or unsupported identifier MUST ignore that setting.
                }
            }
        }

        let _ = self.flusher.submit(
            self,
            Entry::Control {
                frame: Frame::Settings(Settings::ack()),
                stream: None,
                task: Task::noop(),
            },
        );

        self.notify(Event::Settings { frame });

        Ok(())
    }

    fn on_push_promise(self: &Arc<Self>, frame: PushPromise<Bytes>) -> Result<(), frame_error::Error> {
        if self.local.is_server() {
            //= https://www.rfc-editor.org/rfc/rfc7540#section-6.6
            //# A client cannot push.  Thus, servers MUST treat the receipt of a
            //# PUSH_PROMISE frame as a connection error (Section 5.4.1) of type
            //# PROTOCOL_ERROR.
            return Err(connection_error!(PROTOCOL_ERROR, "push promise from a client"));
        }

        let promised = frame.promised_stream_id;
        let Some(stream) = self.create_remote_stream(promised, true)? else {
            return Ok(());
        };

        // the request headers travel in the promise itself, so the stream
        // is reserved until the pushed response's HEADERS arrive
        stream.on_push_promise_received();

        self.notify(Event::NewStream { stream });

        Ok(())
    }

    fn on_ping(self: &Arc<Self>, frame: Ping) -> Result<(), frame_error::Error> {
        if frame.ack {
            self.notify(Event::PingReply {
                payload: frame.payload,
            });
            return Ok(());
        }

        // replies jump the queue so round-trip samples stay honest
        let _ = self.flusher.prepend(
            self,
            Entry::Control {
                frame: Frame::Ping(Ping::reply(frame.payload)),
                stream: None,
                task: Task::noop(),
            },
        );

        Ok(())
    }

    fn on_go_away(self: &Arc<Self>, frame: GoAway<Bytes>) -> Result<(), frame_error::Error> {
        if self
            .close_state
            .transition(CloseState::NotClosed, CloseState::RemotelyClosed)
        {
            self.notify(Event::GoAway {
                last_stream_id: frame.last_stream_id,
                error_code: frame.error_code,
                debug_data: frame.debug_data,
            });

            // drain what is queued, then close the transport
            let _ = self.flusher.submit(
                self,
                Entry::Disconnect {
                    task: Task::noop(),
                },
            );
        } else {
            tracing::debug!("goaway while already closing");
        }

        Ok(())
    }

    fn on_window_update(self: &Arc<Self>, frame: WindowUpdate) -> Result<(), frame_error::Error> {
        //= https://www.rfc-editor.org/rfc/rfc7540#section-6.9
        //# A receiver MUST treat the receipt of a WINDOW_UPDATE frame with an
        //# flow-control window increment of 0 as a stream error
        //# (Section 5.4.2) of type PROTOCOL_ERROR; errors on the connection
        //# flow-control window MUST be treated as a connection error
        //# (Section 5.4.1).
        if frame.increment == 0 {
            if frame.stream_id.is_connection() {
                return Err(connection_error!(
                    PROTOCOL_ERROR,
                    "window update with zero increment"
                ));
            }
            if let Some(stream) = self.streams.get(frame.stream_id) {
                self.reset_stream_for_error(
                    &stream,
                    stream_error!(PROTOCOL_ERROR, "window update with zero increment"),
                );
            }
            return Ok(());
        }

        // never applied here: the flusher reads both windows when slicing
        // data, so it is the only place credits may land
        if frame.stream_id.is_connection() {
            self.flusher.window(self, None, frame);
        } else if let Some(stream) = self.streams.get(frame.stream_id) {
            self.flusher.window(self, Some(stream), frame);
        } else {
            tracing::debug!(
                stream = frame.stream_id.as_u32(),
                "window update for an unknown stream"
            );
        }

        Ok(())
    }

    // ===== outbound API =====

    /// Opens a local stream with its initial HEADERS frame
    ///
    /// Stream-id allocation and the enqueue of the HEADERS frame are atomic
    /// as a pair, so wire order always matches id order.
    pub fn new_stream(
        self: &Arc<Self>,
        frame: Headers<Bytes>,
        task: Task,
    ) -> Result<Arc<Stream>, Error> {
        if self.close_state.load() != CloseState::NotClosed {
            task.complete(Err(Error::Closed));
            return Err(Error::Closed);
        }

        let mut task = Some(task);
        let mut frame = Some(frame);
        let outcome = self.flusher.with_queue(self, |queue| {
            let Some(mut frame) = frame.take() else {
                return Err(stream_error!(INTERNAL_ERROR, "missing frame"));
            };

            let id = self.claim_stream_id(frame.stream_id)?;
            frame.stream_id = id;

            let stream = self.factory.create(
                id,
                true,
                self.remote_initial_window(),
                self.local_initial_window(),
            );

            self.streams
                .insert(stream.clone(), self.max_local_streams.load(Ordering::Acquire))
                .map_err(|error| match error {
                    InsertError::AtCapacity => {
                        stream_error!(REFUSED_STREAM, "max local streams exceeded")
                    }
                    InsertError::Duplicate => {
                        stream_error!(PROTOCOL_ERROR, "stream id already in use")
                    }
                })?;

            self.flow.on_stream_created(&stream);

            if let Some(task) = task.take() {
                queue.push_back(Entry::Control {
                    frame: Frame::Headers(frame),
                    stream: Some(stream.clone()),
                    task,
                });
            }

            Ok(stream)
        });

        match outcome {
            Ok(Ok(stream)) => {
                self.start_stream_idle_timer(&stream);
                Ok(stream)
            }
            Ok(Err(error)) => {
                let error = Error::Protocol(error);
                if let Some(task) = task.take() {
                    task.complete(Err(error.clone()));
                }
                Err(error)
            }
            Err(error) => {
                if let Some(task) = task.take() {
                    task.complete(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Reserves a pushed stream with a PUSH_PROMISE on `parent`
    pub fn push(
        self: &Arc<Self>,
        parent: &Arc<Stream>,
        frame: PushPromise<Bytes>,
        task: Task,
    ) -> Result<Arc<Stream>, Error> {
        if !self.push_enabled() {
            let error = Error::Protocol(stream_error!(
                REFUSED_STREAM,
                "push is disabled by the peer"
            ));
            task.complete(Err(error.clone()));
            return Err(error);
        }

        let mut task = Some(task);
        let mut frame = Some(frame);
        let outcome = self.flusher.with_queue(self, |queue| {
            let Some(mut frame) = frame.take() else {
                return Err(stream_error!(INTERNAL_ERROR, "missing frame"));
            };

            let id = self.claim_stream_id(StreamId::CONNECTION)?;
            frame.stream_id = parent.id();
            frame.promised_stream_id = id;

            let stream = self.factory.create(
                id,
                true,
                self.remote_initial_window(),
                self.local_initial_window(),
            );

            self.streams
                .insert(stream.clone(), self.max_local_streams.load(Ordering::Acquire))
                .map_err(|error| match error {
                    InsertError::AtCapacity => {
                        stream_error!(REFUSED_STREAM, "max local streams exceeded")
                    }
                    InsertError::Duplicate => {
                        stream_error!(PROTOCOL_ERROR, "stream id already in use")
                    }
                })?;

            self.flow.on_stream_created(&stream);

            if let Some(task) = task.take() {
                queue.push_back(Entry::Control {
                    frame: Frame::PushPromise(frame),
                    stream: Some(stream.clone()),
                    task,
                });
            }

            Ok(stream)
        });

        match outcome {
            Ok(Ok(stream)) => {
                self.start_stream_idle_timer(&stream);
                Ok(stream)
            }
            Ok(Err(error)) => {
                let error = Error::Protocol(error);
                if let Some(task) = task.take() {
                    task.complete(Err(error.clone()));
                }
                Err(error)
            }
            Err(error) => {
                if let Some(task) = task.take() {
                    task.complete(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Submits a PRIORITY frame, allocating an id when it opens a stream
    pub fn priority(self: &Arc<Self>, frame: Priority, task: Task) -> Result<StreamId, Error> {
        let mut task = Some(task);
        let outcome = self.flusher.with_queue(self, |queue| {
            let mut frame = frame;
            if frame.stream_id.is_connection() {
                frame.stream_id = self.claim_stream_id(StreamId::CONNECTION)?;
            }
            let id = frame.stream_id;
            if let Some(task) = task.take() {
                queue.push_back(Entry::Control {
                    frame: Frame::Priority(frame),
                    stream: None,
                    task,
                });
            }
            Ok(id)
        });

        match outcome {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(error)) => {
                let error = Error::Protocol(error);
                if let Some(task) = task.take() {
                    task.complete(Err(error.clone()));
                }
                Err(error)
            }
            Err(error) => {
                if let Some(task) = task.take() {
                    task.complete(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Submits DATA on an open stream
    ///
    /// The flusher slices the payload by the send windows and the peer's
    /// frame size cap; the task completes when the final octet is written.
    pub fn data(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        frame: Data<Bytes>,
        task: Task,
    ) -> Result<(), Error> {
        if stream.is_reset() || stream.is_local_closed() {
            let error = Error::Protocol(stream_error!(STREAM_CLOSED, "stream closed for sending"));
            task.complete(Err(error.clone()));
            return Err(error);
        }

        self.flusher.submit(
            self,
            Entry::Data(DataEntry {
                stream: stream.clone(),
                data: frame.data,
                end_stream: frame.end_stream,
                task,
            }),
        )
    }

    /// Submits a SETTINGS frame
    ///
    /// A changed INITIAL_WINDOW_SIZE takes effect locally in the flusher's
    /// pre-write hook, atomically with the frame's emission.
    pub fn settings(self: &Arc<Self>, frame: Settings, task: Task) -> Result<(), Error> {
        self.flusher.submit(
            self,
            Entry::Control {
                frame: Frame::Settings(frame),
                stream: None,
                task,
            },
        )
    }

    /// Submits a PING; the reply surfaces as [`Event::PingReply`]
    ///
    /// Pings jump ahead of queued frames so round trips measure the
    /// network, not the local backlog.
    pub fn ping(self: &Arc<Self>, frame: Ping, task: Task) -> Result<(), Error> {
        if frame.ack {
            let error = Error::Protocol(connection_error!(
                PROTOCOL_ERROR,
                "ping replies are generated by the session"
            ));
            task.complete(Err(error.clone()));
            return Err(error);
        }

        self.flusher.prepend(
            self,
            Entry::Control {
                frame: Frame::Ping(frame),
                stream: None,
                task,
            },
        )
    }

    /// Initiates a graceful close
    ///
    /// The first call emits one GOAWAY and the task completes when it is
    /// flushed, after which only transport output is shut down; reads
    /// continue until the peer hangs up. Later calls succeed immediately
    /// without further effect.
    pub fn close(self: &Arc<Self>, error_code: ErrorCode, reason: &str, task: Task) -> bool {
        if self
            .close_state
            .transition(CloseState::NotClosed, CloseState::LocallyClosed)
        {
            let frame = GoAway {
                last_stream_id: self.last_remote_stream_id(),
                error_code,
                debug_data: truncate_reason(reason),
            };
            let _ = self.flusher.submit(
                self,
                Entry::Control {
                    frame: Frame::GoAway(frame),
                    stream: None,
                    task,
                },
            );
            true
        } else {
            task.complete(Ok(()));
            false
        }
    }

    /// Resets `stream` with `error_code`
    pub fn reset(self: &Arc<Self>, stream: &Arc<Stream>, error_code: ErrorCode, task: Task) {
        if stream.is_reset() {
            task.complete(Ok(()));
            return;
        }
        stream.on_reset();

        let _ = self.flusher.submit(
            self,
            Entry::Control {
                frame: Frame::RstStream(RstStream {
                    stream_id: stream.id(),
                    error_code,
                }),
                stream: Some(stream.clone()),
                task,
            },
        );

        self.notify(Event::Reset {
            stream_id: stream.id(),
            error_code,
            local: true,
        });
    }

    /// Returns flow-control credit for octets the application consumed
    pub fn data_consumed(self: &Arc<Self>, stream: &Arc<Stream>, size: usize) {
        self.flow.on_data_consumed(self, stream, size as u32);
    }

    // ===== failure and shutdown =====

    /// Fails the connection: GOAWAY with the error, then transport close
    pub(crate) fn fail(self: &Arc<Self>, error: frame_error::Error) {
        if self
            .close_state
            .transition(CloseState::NotClosed, CloseState::LocallyClosed)
        {
            tracing::warn!(%error, "connection failure");
            self.notify(Event::Failure {
                error: Error::Protocol(error),
            });

            let frame = GoAway {
                last_stream_id: self.last_remote_stream_id(),
                error_code: error.code,
                debug_data: truncate_reason(error.reason),
            };
            let _ = self.flusher.submit(
                self,
                Entry::Control {
                    frame: Frame::GoAway(frame),
                    stream: None,
                    task: Task::noop(),
                },
            );
            let _ = self.flusher.submit(
                self,
                Entry::Disconnect {
                    task: Task::noop(),
                },
            );
        } else {
            // the race loser adopts the winner's shutdown
            tracing::debug!(%error, "connection failure while closing");
        }
    }

    /// Tears the session down immediately; no further frames are written
    pub(crate) fn abort(self: &Arc<Self>, error: Error) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        self.notify(Event::Failure {
            error: error.clone(),
        });
        self.terminate(Some(error));
    }

    /// Completes the DISCONNECT entry's drain-then-close path
    pub(crate) fn finish_disconnect(self: &Arc<Self>, task: Task) {
        task.complete(Ok(()));
        self.terminate(None);
    }

    fn terminate(self: &Arc<Self>, error: Option<Error>) {
        // the transport is closed exactly once
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        self.close_state.close();

        if let Some(timer) = lock(&self.session_timer).take() {
            timer.cancel();
        }

        self.flusher
            .terminate(error.clone().unwrap_or(Error::Closed));

        for stream in self.streams.drain() {
            stream.on_reset();
            self.flow.on_stream_destroyed(self, &stream);
        }

        self.transport.close();
    }

    // ===== engine support =====

    #[inline]
    pub(crate) fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    #[inline]
    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[inline]
    pub(crate) fn flow(&self) -> &Arc<dyn FlowController> {
        &self.flow
    }

    pub(crate) fn notify(&self, event: Event) {
        self.notifier.event(event);
    }

    pub(crate) fn add_bytes_written(&self, len: u64) {
        self.bytes_written.fetch_add(len, Ordering::AcqRel);
    }

    /// Removes a stream from the registry; idempotent
    pub(crate) fn remove_stream(self: &Arc<Self>, stream: &Arc<Stream>) {
        if let Some(stream) = self.streams.remove(stream.id()) {
            self.flow.on_stream_destroyed(self, &stream);
        }
    }

    /// Resets a stream in response to a stream-scoped protocol error
    pub(crate) fn reset_stream_for_error(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        error: frame_error::Error,
    ) {
        debug_assert!(!error.is_connection_error());
        tracing::debug!(stream = stream.id().as_u32(), %error, "stream failure");
        self.reset(stream, error.code, Task::noop());
    }

    /// Enqueues a WINDOW_UPDATE announcing returned credit
    pub(crate) fn submit_window_update(
        self: &Arc<Self>,
        stream: Option<&Arc<Stream>>,
        increment: u32,
    ) {
        let frame = WindowUpdate {
            stream_id: stream.map_or(StreamId::CONNECTION, |stream| stream.id()),
            increment,
        };
        let _ = self.flusher.submit(
            self,
            Entry::Control {
                frame: Frame::WindowUpdate(frame),
                stream: stream.cloned(),
                task: Task::noop(),
            },
        );
    }

    fn send_reset(self: &Arc<Self>, stream_id: StreamId, error_code: ErrorCode) {
        let _ = self.flusher.submit(
            self,
            Entry::Control {
                frame: Frame::RstStream(RstStream {
                    stream_id,
                    error_code,
                }),
                stream: None,
                task: Task::noop(),
            },
        );

        self.notify(Event::Reset {
            stream_id,
            error_code,
            local: true,
        });
    }

    /// Claims the next local stream id, or validates a preset one
    ///
    /// Only called under the flusher queue lock, which is what makes the
    /// id sequence match the wire order of opening frames.
    fn claim_stream_id(&self, preset: StreamId) -> Result<StreamId, frame_error::Error> {
        let next = self.next_local_stream_id.load(Ordering::Acquire);

        let id = if preset.is_connection() {
            if next > u64::from(MAX_STREAM_ID) {
                return Err(stream_error!(REFUSED_STREAM, "stream ids exhausted"));
            }
            StreamId::new_truncated(next as u32)
        } else {
            // preset ids come from the HTTP/1.1 upgrade path
            if preset.initiator() != self.local {
                return Err(stream_error!(PROTOCOL_ERROR, "stream id has the wrong parity"));
            }
            if u64::from(preset.as_u32()) < next {
                return Err(stream_error!(PROTOCOL_ERROR, "stream id already used"));
            }
            preset
        };

        self.next_local_stream_id
            .store(u64::from(id.as_u32()) + 2, Ordering::Release);

        Ok(id)
    }

    // ===== flow-control support =====

    #[inline]
    pub fn debit_recv_window(&self, amount: u32) -> i32 {
        crate::stream::debit(&self.recv_window, amount)
    }

    #[inline]
    pub fn credit_recv_window(&self, increment: u32) -> Result<i32, frame_error::Error> {
        crate::stream::update(&self.recv_window, |current| {
            window::checked_credit(current, increment)
        })
    }

    /// Flusher only
    #[inline]
    pub(crate) fn debit_send_window(&self, amount: u32) -> i32 {
        crate::stream::debit(&self.send_window, amount)
    }

    /// Flusher only
    #[inline]
    pub(crate) fn credit_send_window(&self, increment: u32) -> Result<i32, frame_error::Error> {
        crate::stream::update(&self.send_window, |current| {
            window::checked_credit(current, increment)
        })
    }

    #[inline]
    pub(crate) fn add_pending_refund(&self, amount: u32) -> u32 {
        self.pending_refund.fetch_add(amount, Ordering::AcqRel) + amount
    }

    #[inline]
    pub(crate) fn take_pending_refund(&self) -> u32 {
        self.pending_refund.swap(0, Ordering::AcqRel)
    }

    /// Swaps the initial window for one direction, returning the delta to
    /// apply to every stream
    pub(crate) fn swap_initial_window(&self, new_initial: u32, local: bool) -> i32 {
        let cell = if local {
            &self.local_initial_window
        } else {
            &self.remote_initial_window
        };
        let old = cell.swap(new_initial as i32, Ordering::AcqRel);
        new_initial as i32 - old
    }

    // ===== idle handling =====

    #[inline]
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    #[inline]
    fn not_idle(&self) {
        self.last_activity.store(self.now_nanos(), Ordering::Release);
    }

    fn schedule_session_idle(self: &Arc<Self>, timeout: Duration, delay: Duration) {
        let session = self.clone();
        let timer = self
            .scheduler
            .schedule(delay, Box::new(move || session.session_idle_fired(timeout)));
        *lock(&self.session_timer) = Some(timer);
    }

    fn session_idle_fired(self: &Arc<Self>, timeout: Duration) {
        let state = self.close_state.load();
        if state == CloseState::Closed {
            return;
        }

        let idle_for = self
            .now_nanos()
            .saturating_sub(self.last_activity.load(Ordering::Acquire));
        let timeout_nanos = timeout.as_nanos() as u64;

        if idle_for < timeout_nanos {
            self.schedule_session_idle(timeout, Duration::from_nanos(timeout_nanos - idle_for));
            return;
        }

        match state {
            CloseState::NotClosed => {
                if self.notifier.idle_timeout() {
                    self.close(ErrorCode::NO_ERROR, "idle_timeout", Task::noop());
                } else {
                    self.not_idle();
                }
                // keep watching; a dead peer escalates to an abort below
                self.schedule_session_idle(timeout, timeout);
            }
            CloseState::LocallyClosed | CloseState::RemotelyClosed => {
                self.abort(Error::IdleTimeout);
            }
            CloseState::Closed => {}
        }
    }

    fn start_stream_idle_timer(self: &Arc<Self>, stream: &Arc<Stream>) {
        if let Some(timeout) = self.config.stream_idle_timeout {
            stream.not_idle(self.now_nanos());
            self.schedule_stream_idle(Arc::downgrade(stream), timeout, timeout);
        }
    }

    fn schedule_stream_idle(self: &Arc<Self>, stream: Weak<Stream>, timeout: Duration, delay: Duration) {
        let session = self.clone();
        let _ = self.scheduler.schedule(
            delay,
            Box::new(move || session.stream_idle_fired(stream, timeout)),
        );
    }

    fn stream_idle_fired(self: &Arc<Self>, weak: Weak<Stream>, timeout: Duration) {
        let Some(stream) = weak.upgrade() else {
            return;
        };
        if self.close_state.load() == CloseState::Closed
            || stream.is_closed()
            || self.streams.get(stream.id()).is_none()
        {
            return;
        }

        let idle_for = self.now_nanos().saturating_sub(stream.last_activity());
        let timeout_nanos = timeout.as_nanos() as u64;

        if idle_for < timeout_nanos {
            self.schedule_stream_idle(weak, timeout, Duration::from_nanos(timeout_nanos - idle_for));
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc7540#section-5.4.2
        //# An endpoint that detects a stream error sends a RST_STREAM frame
        //# (Section 6.4) that contains the stream identifier of the stream
        //# where the error occurred.
        self.reset(&stream, ErrorCode::CANCEL, Task::noop());
    }
}

/// Truncates a GOAWAY reason to at most 32 UTF-8 octets on a character
/// boundary
fn truncate_reason(reason: &str) -> Bytes {
    let mut end = reason.len().min(GOAWAY_REASON_LIMIT);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Bytes::copy_from_slice(&reason.as_bytes()[..end])
}
