// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tests for the session engine

use super::*;
use crate::{
    config::UNLIMITED_STREAMS,
    scheduler::{Scheduler, Timer},
    transport::{Transport, WriteCompletion},
};
use s2n_codec::{DecoderBufferMut, Encoder, EncoderBuffer, EncoderValue};
use s2n_http2_core::frame::{settings::Setting, Frame};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

// ===== mock collaborators =====

struct MockTransport {
    writes: Mutex<Vec<Bytes>>,
    pending: Mutex<VecDeque<WriteCompletion>>,
    inline: bool,
    output_shutdown: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    /// Completes every write synchronously
    fn inline() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            inline: true,
            output_shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Holds completions until the test releases them
    fn manual() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            inline: false,
            output_shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn complete_next(&self) -> bool {
        let completion = lock(&self.pending).pop_front();
        match completion {
            Some(completion) => {
                completion(Ok(()));
                true
            }
            None => false,
        }
    }

    fn fail_next(&self) -> bool {
        let completion = lock(&self.pending).pop_front();
        match completion {
            Some(completion) => {
                completion(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));
                true
            }
            None => false,
        }
    }

    fn complete_all(&self) {
        while self.complete_next() {}
    }

    /// Every frame written so far, in wire order
    fn frames(&self) -> Vec<Frame<Bytes>> {
        let mut bytes = Vec::new();
        for write in lock(&self.writes).iter() {
            bytes.extend_from_slice(write);
        }
        parse_frames(bytes)
    }

    fn is_output_shutdown(&self) -> bool {
        self.output_shutdown.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn write(&self, data: Bytes, on_complete: WriteCompletion) {
        lock(&self.writes).push(data);
        if self.inline {
            on_complete(Ok(()));
        } else {
            lock(&self.pending).push_back(on_complete);
        }
    }

    fn shutdown_output(&self) {
        self.output_shutdown.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct Scheduled {
    task: Box<dyn FnOnce() + Send>,
    canceled: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockScheduler {
    tasks: Mutex<VecDeque<Scheduled>>,
}

struct MockTimer {
    canceled: Arc<AtomicBool>,
}

impl Timer for MockTimer {
    fn cancel(&self) -> bool {
        !self.canceled.swap(true, Ordering::SeqCst)
    }
}

impl MockScheduler {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs the oldest scheduled task that has not been canceled
    fn fire_next(&self) -> bool {
        loop {
            let scheduled = lock(&self.tasks).pop_front();
            let Some(scheduled) = scheduled else {
                return false;
            };
            if scheduled.canceled.load(Ordering::SeqCst) {
                continue;
            }
            (scheduled.task)();
            return true;
        }
    }

    fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl Scheduler for MockScheduler {
    fn schedule(&self, _delay: Duration, task: Box<dyn FnOnce() + Send>) -> Box<dyn Timer> {
        let canceled = Arc::new(AtomicBool::new(false));
        lock(&self.tasks).push_back(Scheduled {
            task,
            canceled: canceled.clone(),
        });
        Box::new(MockTimer { canceled })
    }
}

/// Flattened events, easy to assert against
#[derive(Clone, Debug, PartialEq)]
enum Recorded {
    NewStream(u32),
    Headers(u32, bool),
    Data(u32, usize, bool),
    Settings(usize),
    PingReply([u8; 8]),
    Reset(u32, ErrorCode, bool),
    GoAway(u32, ErrorCode),
    Failure(String),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Recorded>>,
    close_on_idle: AtomicBool,
}

impl Recorder {
    fn new() -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        recorder.close_on_idle.store(true, Ordering::SeqCst);
        recorder
    }

    fn recorded(&self) -> Vec<Recorded> {
        lock(&self.events).clone()
    }

    fn contains(&self, expected: &Recorded) -> bool {
        lock(&self.events).contains(expected)
    }
}

impl SessionListener for Recorder {
    fn on_event(&self, event: Event) {
        let recorded = match event {
            Event::NewStream { stream } => Recorded::NewStream(stream.id().as_u32()),
            Event::Headers { stream, frame } => {
                Recorded::Headers(stream.id().as_u32(), frame.end_stream)
            }
            Event::Data {
                stream,
                data,
                end_stream,
            } => Recorded::Data(stream.id().as_u32(), data.len(), end_stream),
            Event::Settings { frame } => Recorded::Settings(frame.settings.len()),
            Event::PingReply { payload } => Recorded::PingReply(payload),
            Event::Reset {
                stream_id,
                error_code,
                local,
            } => Recorded::Reset(stream_id.as_u32(), error_code, local),
            Event::GoAway {
                last_stream_id,
                error_code,
                ..
            } => Recorded::GoAway(last_stream_id.as_u32(), error_code),
            Event::Failure { error } => Recorded::Failure(error.to_string()),
        };
        lock(&self.events).push(recorded);
    }

    fn on_idle_timeout(&self) -> bool {
        self.close_on_idle.load(Ordering::SeqCst)
    }
}

// ===== harness =====

struct Harness {
    session: Arc<Session>,
    transport: Arc<MockTransport>,
    scheduler: Arc<MockScheduler>,
    listener: Arc<Recorder>,
}

struct ListenerHandle(Arc<Recorder>);

impl SessionListener for ListenerHandle {
    fn on_event(&self, event: Event) {
        self.0.on_event(event);
    }

    fn on_idle_timeout(&self) -> bool {
        self.0.on_idle_timeout()
    }
}

fn harness(local: endpoint::Type, config: Config, transport: Arc<MockTransport>) -> Harness {
    let scheduler = MockScheduler::new();
    let listener = Recorder::new();
    let session = Session::builder(local, config).build(
        transport.clone(),
        scheduler.clone(),
        Box::new(ListenerHandle(listener.clone())),
    );

    Harness {
        session,
        transport,
        scheduler,
        listener,
    }
}

fn server(transport: Arc<MockTransport>) -> Harness {
    harness(endpoint::Type::Server, Config::new(), transport)
}

fn client(transport: Arc<MockTransport>) -> Harness {
    harness(endpoint::Type::Client, Config::new(), transport)
}

fn parse_frames(mut bytes: Vec<u8>) -> Vec<Frame<Bytes>> {
    let mut frames = Vec::new();
    let mut buffer = DecoderBufferMut::new(&mut bytes);
    while !buffer.is_empty() {
        let (header, rest) = buffer.decode::<FrameHeader>().unwrap();
        let (payload, rest) = rest.decode_slice(header.payload_len()).unwrap();
        let (frame, _) = FrameMut::decode(header, payload).unwrap();
        frames.push(frame.into_owned());
        buffer = rest;
    }
    frames
}

/// Feeds a frame through the wire codec into the session, the way the
/// parser layer does
fn deliver(session: &Arc<Session>, frame: Frame<Bytes>) -> Result<(), Error> {
    let size = frame.encoding_size();
    let mut bytes = vec![0u8; size];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&frame);

    let buffer = DecoderBufferMut::new(&mut bytes);
    let (header, payload) = buffer.decode::<FrameHeader>().unwrap();
    let (frame, _) = FrameMut::decode(header, payload).unwrap();
    session.on_frame(frame)
}

fn request_headers(stream_id: u32, end_stream: bool) -> Headers<Bytes> {
    Headers {
        stream_id: StreamId::new_truncated(stream_id),
        end_stream,
        end_headers: true,
        dependency: None,
        fragment: Bytes::from_static(&[0x82, 0x84]),
    }
}

fn open_remote_stream(harness: &Harness, stream_id: u32) -> Arc<Stream> {
    deliver(
        &harness.session,
        Frame::Headers(request_headers(stream_id, false)),
    )
    .unwrap();
    harness
        .session
        .stream(StreamId::new_truncated(stream_id))
        .expect("stream was created")
}

fn data_frame(stream_id: u32, len: usize, padding: Option<u8>, end_stream: bool) -> Frame<Bytes> {
    Frame::Data(Data {
        stream_id: StreamId::new_truncated(stream_id),
        end_stream,
        padding,
        data: Bytes::from(vec![0x5au8; len]),
    })
}

// ===== scenarios =====

/// S1: SETTINGS{INITIAL_WINDOW_SIZE=131070, MAX_FRAME_SIZE=32768} grows
/// every stream send window by 65535, caps frames at 32768, and is acked
#[test]
fn settings_round_trip() {
    let h = server(MockTransport::inline());
    let stream = open_remote_stream(&h, 1);
    assert_eq!(stream.send_window(), 65_535);

    deliver(
        &h.session,
        Frame::Settings(Settings {
            ack: false,
            settings: vec![
                Setting::new(settings::Id::INITIAL_WINDOW_SIZE, 131_070),
                Setting::new(settings::Id::MAX_FRAME_SIZE, 32_768),
            ],
        }),
    )
    .unwrap();

    assert_eq!(stream.send_window(), 131_070);
    assert_eq!(h.session.max_frame_size(), 32_768);

    let acks: Vec<_> = h
        .transport
        .frames()
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Settings(settings) => Some(settings),
            _ => None,
        })
        .collect();
    assert_eq!(acks.len(), 1);
    assert!(acks[0].ack);
    assert!(acks[0].settings.is_empty());

    assert!(h.listener.contains(&Recorded::Settings(2)));
}

/// S2: a DATA frame debits both receive windows by payload plus padding
#[test]
fn flow_control_debit() {
    let h = server(MockTransport::inline());
    let stream = open_remote_stream(&h, 1);

    // 100 octets of payload, 10 of padding (pad length octet included)
    deliver(&h.session, data_frame(1, 100, Some(9), false)).unwrap();

    assert_eq!(h.session.recv_window(), 65_535 - 110);
    assert_eq!(stream.recv_window(), 65_535 - 110);

    // a refund below the threshold stays pending
    h.session.data_consumed(&stream, 110);
    let window_updates = h
        .transport
        .frames()
        .into_iter()
        .filter(|frame| matches!(frame, Frame::WindowUpdate(_)))
        .count();
    assert_eq!(window_updates, 0);
}

/// Refunds that cross half the window emit WINDOW_UPDATE at both scopes
/// and restore the windows once the frames are written
#[test]
fn flow_control_refund_threshold() {
    let h = server(MockTransport::inline());
    let stream = open_remote_stream(&h, 1);

    let mut delivered = 0usize;
    for _ in 0..3 {
        deliver(&h.session, data_frame(1, 16_000, None, false)).unwrap();
        delivered += 16_000;
    }
    assert_eq!(h.session.recv_window(), 65_535 - delivered as i32);

    h.session.data_consumed(&stream, delivered);

    let updates: Vec<_> = h
        .transport
        .frames()
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::WindowUpdate(update) => Some(update),
            _ => None,
        })
        .collect();

    assert!(
        updates
            .iter()
            .any(|update| update.stream_id.is_connection() && update.increment == 48_000),
        "missing session window update: {updates:?}"
    );
    assert!(
        updates
            .iter()
            .any(|update| update.stream_id.as_u32() == 1 && update.increment == 48_000),
        "missing stream window update: {updates:?}"
    );

    // the credit took effect when the frames were flushed
    assert_eq!(h.session.recv_window(), 65_535);
    assert_eq!(stream.recv_window(), 65_535);
}

/// S3: SETTINGS_ENABLE_PUSH outside {0,1} fails the connection
#[test]
fn invalid_enable_push() {
    let h = server(MockTransport::inline());

    let result = deliver(
        &h.session,
        Frame::Settings(Settings {
            ack: false,
            settings: vec![Setting::new(settings::Id::ENABLE_PUSH, 2)],
        }),
    );
    assert!(result.is_err());

    let goaways: Vec<_> = h
        .transport
        .frames()
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::GoAway(goaway) => Some(goaway),
            _ => None,
        })
        .collect();
    assert_eq!(goaways.len(), 1);
    assert_eq!(goaways[0].error_code, ErrorCode::PROTOCOL_ERROR);
    assert_eq!(&goaways[0].debug_data[..], b"invalid_settings_enable_push");

    // the failure path runs the disconnect after the GOAWAY drains
    assert_eq!(h.session.close_state(), CloseState::Closed);
    assert!(h.transport.is_closed());
}

/// S4: a remote stream id that does not increase is a connection error
#[test]
fn duplicate_remote_stream() {
    let h = server(MockTransport::inline());
    open_remote_stream(&h, 3);

    // the peer resets its own stream, then tries to reuse the id
    deliver(
        &h.session,
        Frame::RstStream(RstStream {
            stream_id: StreamId::new_truncated(3),
            error_code: ErrorCode::CANCEL,
        }),
    )
    .unwrap();
    assert!(h.session.stream(StreamId::new_truncated(3)).is_none());

    let result = deliver(&h.session, Frame::Headers(request_headers(3, false)));
    assert!(result.is_err());

    let goaway = h
        .transport
        .frames()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::GoAway(goaway) => Some(goaway),
            _ => None,
        })
        .expect("a GOAWAY was emitted");
    assert_eq!(goaway.error_code, ErrorCode::PROTOCOL_ERROR);
}

/// S5: the third stream over a cap of two is refused; the session survives
#[test]
fn remote_stream_cap_breach() {
    let config = Config::new().with_max_remote_streams(2).unwrap();
    let h = harness(endpoint::Type::Server, config, MockTransport::inline());

    open_remote_stream(&h, 1);
    open_remote_stream(&h, 3);
    deliver(&h.session, Frame::Headers(request_headers(5, false))).unwrap();

    assert!(h.session.stream(StreamId::new_truncated(5)).is_none());
    assert_eq!(h.session.remote_stream_count(), 2);
    assert_eq!(h.session.close_state(), CloseState::NotClosed);

    let reset = h
        .transport
        .frames()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::RstStream(reset) => Some(reset),
            _ => None,
        })
        .expect("a RST_STREAM was emitted");
    assert_eq!(reset.stream_id.as_u32(), 5);
    assert_eq!(reset.error_code, ErrorCode::REFUSED_STREAM);

    assert!(h
        .listener
        .contains(&Recorded::Reset(5, ErrorCode::REFUSED_STREAM, true)));
}

/// S6: a graceful close drains pending DATA, emits one GOAWAY, and shuts
/// down output only; input keeps running until the peer's FIN
#[test]
fn graceful_close_ordering() {
    let h = server(MockTransport::manual());
    let stream = open_remote_stream(&h, 1);
    h.transport.complete_all();

    h.session
        .data(
            &stream,
            Data {
                stream_id: stream.id(),
                end_stream: false,
                padding: None,
                data: Bytes::from(vec![0x42u8; 4096]),
            },
            Task::noop(),
        )
        .unwrap();

    let closed = Arc::new(AtomicBool::new(false));
    let closed_flag = closed.clone();
    h.session.close(
        ErrorCode::NO_ERROR,
        "stop",
        Task::non_blocking(move |result| {
            assert!(result.is_ok());
            closed_flag.store(true, Ordering::SeqCst);
        }),
    );

    h.transport.complete_all();

    let frames = h.transport.frames();
    let data_position = frames
        .iter()
        .position(|frame| matches!(frame, Frame::Data(data) if data.data.len() == 4096))
        .expect("pending data was flushed");
    let goaway_position = frames
        .iter()
        .position(|frame| matches!(frame, Frame::GoAway(_)))
        .expect("a GOAWAY was emitted");
    assert!(data_position < goaway_position, "{frames:?}");

    match &frames[goaway_position] {
        Frame::GoAway(goaway) => {
            assert_eq!(goaway.last_stream_id.as_u32(), 1);
            assert_eq!(goaway.error_code, ErrorCode::NO_ERROR);
            assert_eq!(&goaway.debug_data[..], b"stop");
        }
        _ => unreachable!(),
    }

    assert!(closed.load(Ordering::SeqCst));
    assert!(h.transport.is_output_shutdown());
    assert!(!h.transport.is_closed());
    assert_eq!(h.session.close_state(), CloseState::LocallyClosed);

    // the peer eventually hangs up
    h.session.on_input_shutdown();
    h.transport.complete_all();
    assert!(h.transport.is_closed());
    assert_eq!(h.session.close_state(), CloseState::Closed);
}

// ===== properties =====

/// Local stream ids are strictly monotone by two with no duplicates under
/// concurrent openers, and wire order matches id order
#[test]
fn concurrent_stream_ids_are_monotone() {
    let h = client(MockTransport::inline());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let session = h.session.clone();
        handles.push(thread::spawn(move || {
            let mut ids = Vec::new();
            for _ in 0..25 {
                let stream = session
                    .new_stream(request_headers(0, true), Task::noop())
                    .unwrap();
                ids.push(stream.id().as_u32());
            }
            ids
        }));
    }

    let mut all_ids: Vec<u32> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    all_ids.sort_unstable();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 100, "ids must be unique");
    assert!(all_ids.iter().all(|id| id % 2 == 1), "client ids are odd");

    let wire_ids: Vec<u32> = h
        .transport
        .frames()
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Headers(headers) => Some(headers.stream_id.as_u32()),
            _ => None,
        })
        .collect();
    assert_eq!(wire_ids.len(), 100);
    assert!(
        wire_ids.windows(2).all(|pair| pair[0] < pair[1]),
        "wire order must match id order"
    );
}

/// A PING overtakes DATA that has not reached the transport yet
#[test]
fn ping_is_prepended_ahead_of_data() {
    let h = server(MockTransport::manual());
    let stream = open_remote_stream(&h, 1);
    h.transport.complete_all();

    h.session
        .data(
            &stream,
            Data {
                stream_id: stream.id(),
                end_stream: false,
                padding: None,
                data: Bytes::from(vec![0u8; 60_000]),
            },
            Task::noop(),
        )
        .unwrap();

    // the first batch is already in flight; the ping must beat the rest
    h.session
        .ping(Ping::new(*b"preceded"), Task::noop())
        .unwrap();

    h.transport.complete_all();

    let frames = h.transport.frames();
    let ping_position = frames
        .iter()
        .position(|frame| matches!(frame, Frame::Ping(_)))
        .expect("the ping was emitted");
    let last_data_position = frames
        .iter()
        .rposition(|frame| matches!(frame, Frame::Data(_)))
        .expect("data was emitted");
    assert!(ping_position < last_data_position, "{frames:?}");
}

/// close() is idempotent: one GOAWAY, and every caller's task succeeds
#[test]
fn close_twice_is_idempotent() {
    let h = server(MockTransport::inline());

    let first = Arc::new(AtomicBool::new(false));
    let flag = first.clone();
    assert!(h.session.close(
        ErrorCode::NO_ERROR,
        "bye",
        Task::non_blocking(move |result| {
            assert!(result.is_ok());
            flag.store(true, Ordering::SeqCst);
        }),
    ));

    let second = Arc::new(AtomicBool::new(false));
    let flag = second.clone();
    assert!(!h.session.close(
        ErrorCode::NO_ERROR,
        "bye again",
        Task::non_blocking(move |result| {
            assert!(result.is_ok());
            flag.store(true, Ordering::SeqCst);
        }),
    ));

    assert!(first.load(Ordering::SeqCst));
    assert!(second.load(Ordering::SeqCst));

    let goaways = h
        .transport
        .frames()
        .into_iter()
        .filter(|frame| matches!(frame, Frame::GoAway(_)))
        .count();
    assert_eq!(goaways, 1);
}

/// Data never outruns its credits: the wire carries
/// min(submitted, granted) and sending resumes on WINDOW_UPDATE
#[test]
fn data_respects_send_windows() {
    let h = server(MockTransport::inline());
    let stream = open_remote_stream(&h, 1);

    // the peer shrinks new-stream windows to zero
    deliver(
        &h.session,
        Frame::Settings(Settings {
            ack: false,
            settings: vec![Setting::new(settings::Id::INITIAL_WINDOW_SIZE, 0)],
        }),
    )
    .unwrap();
    assert_eq!(stream.send_window(), 0);

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    h.session
        .data(
            &stream,
            Data {
                stream_id: stream.id(),
                end_stream: true,
                padding: None,
                data: Bytes::from(vec![0x42u8; 1000]),
            },
            Task::non_blocking(move |result| {
                assert!(result.is_ok());
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let sent = |transport: &MockTransport| -> usize {
        transport
            .frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) => Some(data.data.len()),
                _ => None,
            })
            .sum()
    };

    assert_eq!(sent(&h.transport), 0, "no credit, no data");
    assert!(!done.load(Ordering::SeqCst));

    deliver(
        &h.session,
        Frame::WindowUpdate(WindowUpdate {
            stream_id: stream.id(),
            increment: 100,
        }),
    )
    .unwrap();
    assert_eq!(sent(&h.transport), 100, "exactly the granted credit");
    assert_eq!(stream.send_window(), 0);

    deliver(
        &h.session,
        Frame::WindowUpdate(WindowUpdate {
            stream_id: stream.id(),
            increment: 10_000,
        }),
    )
    .unwrap();
    assert_eq!(sent(&h.transport), 1000, "never more than submitted");
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(h.session.send_window(), 65_535 - 1000);
}

/// The session window constrains all streams together
#[test]
fn session_window_is_shared() {
    let h = server(MockTransport::inline());
    let first = open_remote_stream(&h, 1);
    let second = open_remote_stream(&h, 3);

    // big per-stream windows so only the session window binds
    deliver(
        &h.session,
        Frame::Settings(Settings {
            ack: false,
            settings: vec![Setting::new(settings::Id::INITIAL_WINDOW_SIZE, 1 << 30)],
        }),
    )
    .unwrap();

    for stream in [&first, &second] {
        h.session
            .data(
                stream,
                Data {
                    stream_id: stream.id(),
                    end_stream: false,
                    padding: None,
                    data: Bytes::from(vec![1u8; 50_000]),
                },
                Task::noop(),
            )
            .unwrap();
    }

    let sent: usize = h
        .transport
        .frames()
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some(data.data.len()),
            _ => None,
        })
        .sum();
    assert_eq!(sent, 65_535, "the session window caps combined output");
    assert_eq!(h.session.send_window(), 0);
}

/// Receive accounting: total session debit equals payload plus padding
/// for any mix of frames
#[test]
fn receive_debit_matches_flow_controlled_size() {
    bolero::check!()
        .with_type::<Vec<(u16, bool)>>()
        .for_each(|frames| {
            let h = server(MockTransport::inline());
            open_remote_stream(&h, 1);

            let mut total = 0i64;
            for (len, padded) in frames {
                let len = usize::from(*len) % 1024;
                let padding = if *padded { Some(7) } else { None };
                let size = len + padding.map_or(0, |pad: u8| 1 + usize::from(pad));
                if total + size as i64 > 60_000 {
                    break;
                }
                total += size as i64;
                deliver(&h.session, data_frame(1, len, padding, false)).unwrap();
            }

            assert_eq!(h.session.recv_window() as i64, 65_535 - total);
        });
}

// ===== inbound handling =====

#[test]
fn ping_is_echoed_with_ack() {
    let h = server(MockTransport::inline());
    deliver(&h.session, Frame::Ping(Ping::new(*b"12345678"))).unwrap();

    let ping = h
        .transport
        .frames()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::Ping(ping) => Some(ping),
            _ => None,
        })
        .expect("the echo was emitted");
    assert!(ping.ack);
    assert_eq!(&ping.payload, b"12345678");
}

#[test]
fn ping_reply_notifies_listener() {
    let h = server(MockTransport::inline());
    deliver(&h.session, Frame::Ping(Ping::reply(*b"87654321"))).unwrap();

    assert!(h.listener.contains(&Recorded::PingReply(*b"87654321")));
    // no echo of an echo
    assert!(h.transport.frames().is_empty());
}

#[test]
fn user_ping_with_ack_is_rejected() {
    let h = server(MockTransport::inline());
    let failed = Arc::new(AtomicBool::new(false));
    let flag = failed.clone();

    let result = h.session.ping(
        Ping::reply(*b"xxxxxxxx"),
        Task::non_blocking(move |result| {
            assert!(result.is_err());
            flag.store(true, Ordering::SeqCst);
        }),
    );
    assert!(result.is_err());
    assert!(failed.load(Ordering::SeqCst));
}

#[test]
fn remote_goaway_drains_and_closes() {
    let h = server(MockTransport::manual());
    let stream = open_remote_stream(&h, 1);

    // leave a write in flight so the drain is observable
    h.session
        .data(
            &stream,
            Data {
                stream_id: stream.id(),
                end_stream: true,
                padding: None,
                data: Bytes::from_static(b"tail"),
            },
            Task::noop(),
        )
        .unwrap();

    deliver(
        &h.session,
        Frame::GoAway(GoAway {
            last_stream_id: StreamId::new_truncated(0),
            error_code: ErrorCode::NO_ERROR,
            debug_data: Bytes::from_static(b"done"),
        }),
    )
    .unwrap();

    assert_eq!(h.session.close_state(), CloseState::RemotelyClosed);
    assert!(h.listener.contains(&Recorded::GoAway(0, ErrorCode::NO_ERROR)));
    assert!(!h.transport.is_closed());

    h.transport.complete_all();
    assert!(h.transport.is_closed());
    assert_eq!(h.session.close_state(), CloseState::Closed);
    assert!(
        h.transport
            .frames()
            .iter()
            .any(|frame| matches!(frame, Frame::Data(data) if &data.data[..] == b"tail")),
        "queued data drained before the close"
    );
    assert_eq!(
        h.session.local_stream_count() + h.session.remote_stream_count(),
        0
    );
}

#[test]
fn data_for_unknown_stream_still_debits_session_window() {
    let h = server(MockTransport::inline());
    open_remote_stream(&h, 1);

    deliver(
        &h.session,
        Frame::RstStream(RstStream {
            stream_id: StreamId::new_truncated(1),
            error_code: ErrorCode::CANCEL,
        }),
    )
    .unwrap();

    // data raced the reset; the session must stay aligned with the peer
    deliver(&h.session, data_frame(1, 500, None, false)).unwrap();
    assert_eq!(h.session.close_state(), CloseState::NotClosed);

    // the drop refunds the credit once the threshold is crossed, so the
    // immediate observable is the debit
    assert!(h.session.recv_window() <= 65_535);
}

#[test]
fn zero_window_update_on_connection_fails() {
    let h = server(MockTransport::inline());
    let result = deliver(
        &h.session,
        Frame::WindowUpdate(WindowUpdate {
            stream_id: StreamId::CONNECTION,
            increment: 0,
        }),
    );
    assert!(result.is_err());
    assert_eq!(h.session.close_state(), CloseState::Closed);
}

#[test]
fn session_window_overflow_fails_the_connection() {
    let h = server(MockTransport::inline());

    deliver(
        &h.session,
        Frame::WindowUpdate(WindowUpdate {
            stream_id: StreamId::CONNECTION,
            increment: i32::MAX as u32,
        }),
    )
    .unwrap();

    let goaway = h
        .transport
        .frames()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::GoAway(goaway) => Some(goaway),
            _ => None,
        })
        .expect("a GOAWAY was emitted");
    assert_eq!(goaway.error_code, ErrorCode::FLOW_CONTROL_ERROR);
}

#[test]
fn push_promise_reserves_a_remote_stream_on_the_client() {
    let h = client(MockTransport::inline());
    let parent = h
        .session
        .new_stream(request_headers(0, true), Task::noop())
        .unwrap();

    deliver(
        &h.session,
        Frame::PushPromise(PushPromise {
            stream_id: parent.id(),
            promised_stream_id: StreamId::new_truncated(2),
            end_headers: true,
            fragment: Bytes::from_static(&[0x82]),
        }),
    )
    .unwrap();

    let promised = h.session.stream(StreamId::new_truncated(2)).unwrap();
    assert!(!promised.is_local());
    assert!(h.listener.contains(&Recorded::NewStream(2)));

    // the pushed response arrives later
    deliver(&h.session, Frame::Headers(request_headers(2, false))).unwrap();
    assert!(h.listener.contains(&Recorded::Headers(2, false)));
}

#[test]
fn client_rejects_unpromised_server_stream() {
    let h = client(MockTransport::inline());
    let result = deliver(&h.session, Frame::Headers(request_headers(2, false)));
    assert!(result.is_err());
    assert_eq!(h.session.close_state(), CloseState::Closed);
}

#[test]
fn server_push_reserves_a_local_stream() {
    let h = server(MockTransport::inline());
    let parent = open_remote_stream(&h, 1);

    let promised = h
        .session
        .push(
            &parent,
            PushPromise {
                stream_id: StreamId::CONNECTION,
                promised_stream_id: StreamId::CONNECTION,
                end_headers: true,
                fragment: Bytes::from_static(&[0x82]),
            },
            Task::noop(),
        )
        .unwrap();

    assert_eq!(promised.id().as_u32() % 2, 0, "server ids are even");
    assert!(promised.is_remote_closed(), "promised streams are reserved");

    let frame = h
        .transport
        .frames()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::PushPromise(push) => Some(push),
            _ => None,
        })
        .expect("the promise was emitted");
    assert_eq!(frame.stream_id, parent.id());
    assert_eq!(frame.promised_stream_id, promised.id());
}

// ===== outbound limits and failure =====

#[test]
fn local_stream_cap_fails_the_submission() {
    let h = client(MockTransport::inline());

    deliver(
        &h.session,
        Frame::Settings(Settings {
            ack: false,
            settings: vec![Setting::new(settings::Id::MAX_CONCURRENT_STREAMS, 1)],
        }),
    )
    .unwrap();

    h.session
        .new_stream(request_headers(0, false), Task::noop())
        .unwrap();

    let failed = Arc::new(AtomicBool::new(false));
    let flag = failed.clone();
    let result = h.session.new_stream(
        request_headers(0, false),
        Task::non_blocking(move |result| {
            assert!(result.is_err());
            flag.store(true, Ordering::SeqCst);
        }),
    );

    assert!(matches!(
        result,
        Err(Error::Protocol(error)) if error.code == ErrorCode::REFUSED_STREAM
    ));
    assert!(failed.load(Ordering::SeqCst));
    assert_eq!(h.session.local_stream_count(), 1);
}

#[test]
fn write_failure_aborts_the_session() {
    let h = server(MockTransport::manual());
    let stream = open_remote_stream(&h, 1);
    h.transport.complete_all();

    let failed = Arc::new(AtomicBool::new(false));
    let flag = failed.clone();
    h.session
        .data(
            &stream,
            Data {
                stream_id: stream.id(),
                end_stream: false,
                padding: None,
                data: Bytes::from_static(b"doomed"),
            },
            Task::non_blocking(move |result| {
                assert!(result.is_err());
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();

    assert!(h.transport.fail_next());

    assert!(failed.load(Ordering::SeqCst));
    assert_eq!(h.session.close_state(), CloseState::Closed);
    assert!(h.transport.is_closed());
    assert!(h
        .listener
        .recorded()
        .iter()
        .any(|event| matches!(event, Recorded::Failure(_))));
}

#[test]
fn submissions_after_close_fail() {
    let h = server(MockTransport::inline());
    let stream = open_remote_stream(&h, 1);

    deliver(
        &h.session,
        Frame::GoAway(GoAway {
            last_stream_id: StreamId::new_truncated(0),
            error_code: ErrorCode::NO_ERROR,
            debug_data: Bytes::new(),
        }),
    )
    .unwrap();
    assert_eq!(h.session.close_state(), CloseState::Closed);

    let result = h.session.data(
        &stream,
        Data {
            stream_id: stream.id(),
            end_stream: false,
            padding: None,
            data: Bytes::from_static(b"late"),
        },
        Task::noop(),
    );
    assert!(result.is_err());

    let result = h
        .session
        .new_stream(request_headers(0, false), Task::noop());
    assert!(result.is_err());
}

// ===== idle timers =====

#[test]
fn session_idle_timeout_closes_gracefully() {
    let config = Config::new()
        .with_session_idle_timeout(Some(Duration::from_nanos(1)))
        .unwrap();
    let h = harness(endpoint::Type::Server, config, MockTransport::inline());

    thread::sleep(Duration::from_millis(2));
    assert!(h.scheduler.fire_next());

    assert_eq!(h.session.close_state(), CloseState::LocallyClosed);
    let goaway = h
        .transport
        .frames()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::GoAway(goaway) => Some(goaway),
            _ => None,
        })
        .expect("a GOAWAY was emitted");
    assert_eq!(goaway.error_code, ErrorCode::NO_ERROR);
    assert_eq!(&goaway.debug_data[..], b"idle_timeout");

    // a second expiry while closing escalates to an abort
    thread::sleep(Duration::from_millis(2));
    assert!(h.scheduler.fire_next());
    assert_eq!(h.session.close_state(), CloseState::Closed);
    assert!(h.transport.is_closed());
}

#[test]
fn session_idle_timeout_can_be_vetoed() {
    let config = Config::new()
        .with_session_idle_timeout(Some(Duration::from_nanos(1)))
        .unwrap();
    let h = harness(endpoint::Type::Server, config, MockTransport::inline());
    h.listener.close_on_idle.store(false, Ordering::SeqCst);

    thread::sleep(Duration::from_millis(2));
    assert!(h.scheduler.fire_next());

    assert_eq!(h.session.close_state(), CloseState::NotClosed);
    assert!(h.scheduler.pending() > 0, "the timer was rescheduled");
}

#[test]
fn stream_idle_timeout_resets_with_cancel() {
    let config = Config::new()
        .with_stream_idle_timeout(Some(Duration::from_nanos(1)))
        .unwrap();
    let h = harness(endpoint::Type::Server, config, MockTransport::inline());
    let stream = open_remote_stream(&h, 1);

    thread::sleep(Duration::from_millis(2));
    // the session timer is first in line
    while h.scheduler.fire_next() {
        if stream.is_reset() {
            break;
        }
    }

    assert!(stream.is_reset());
    let reset = h
        .transport
        .frames()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::RstStream(reset) => Some(reset),
            _ => None,
        })
        .expect("a RST_STREAM was emitted");
    assert_eq!(reset.stream_id.as_u32(), 1);
    assert_eq!(reset.error_code, ErrorCode::CANCEL);

    assert!(h.session.stream(StreamId::new_truncated(1)).is_none());
    assert_eq!(h.session.close_state(), CloseState::NotClosed);
}

// ===== unbounded caps =====

#[test]
fn negative_cap_means_unbounded() {
    let config = Config::new()
        .with_max_remote_streams(UNLIMITED_STREAMS)
        .unwrap();
    let h = harness(endpoint::Type::Server, config, MockTransport::inline());

    for n in 0..200u32 {
        open_remote_stream(&h, 1 + 2 * n);
    }
    assert_eq!(h.session.remote_stream_count(), 200);
}
