use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use tracing::{debug, error, info, trace, warn};

use crate::amf0::{Amf0Command, Amf0Value, decode_amf0_command, encode_amf0_command,
                  encode_amf0_values};
use crate::chunk::{ChunkStreams, IdParse, parse_id};
use crate::error::RtmpError;
use crate::flv::split_aggregate;
use crate::message::{
    DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW_ACK_SIZE, MAXIMUM_CHUNK_SIZE, MINIMUM_CHUNK_SIZE,
    MessageType, ProtocolControl, RtmpMessage, UserControl, UserControlType,
};

const READ_SIZE: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Name delivered to pending command callbacks when the connection goes
/// away before the server answers.
pub const COMMAND_CANCELLED: &str = "<cancelled>";

/// Result of a command the server answered (or a synthetic cancellation).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub name: String,
    pub args: Vec<Amf0Value>,
}

impl CommandResult {
    pub fn is_cancelled(&self) -> bool {
        self.name == COMMAND_CANCELLED
    }
}

pub type CommandReceiver = Receiver<CommandResult>;

/// Events fanned out from the connection loop.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A media or data message that no built-in handler consumed.
    Message(RtmpMessage),
    /// StreamBegin/StreamEof/StreamDry/StreamIsRecorded notification.
    StreamControl {
        event_type: UserControlType,
        stream_id: u32,
    },
    /// First unrecoverable error; the connection refuses further work.
    Error(Arc<RtmpError>),
    Closed,
}

/// Connection counters, snapshot-readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub in_chunk_size: u32,
    pub out_chunk_size: u32,
    pub in_window_ack_size: u32,
    pub out_window_ack_size: u32,
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
    pub in_bytes_acked: u64,
    pub out_bytes_acked: u64,
}

enum ControlItem {
    Message(RtmpMessage),
    Command {
        stream_id: u32,
        name: String,
        args: Vec<Amf0Value>,
        response: Option<Sender<CommandResult>>,
    },
    Expect {
        stream_id: u32,
        name: String,
        response: Sender<CommandResult>,
    },
    SetDataFrame(RtmpMessage),
    Close,
}

struct Transaction {
    transaction_id: f64,
    response: Sender<CommandResult>,
}

struct ExpectedCommand {
    stream_id: u32,
    name: String,
    response: Sender<CommandResult>,
}

/// In-flight transactions and expected server-initiated commands.
///
/// Every registered sender fires exactly once: with the server's reply, or
/// with the synthetic cancellation result.
#[derive(Default)]
struct CommandTable {
    transactions: Vec<Transaction>,
    expected: Vec<ExpectedCommand>,
    transaction_count: u32,
}

impl CommandTable {
    fn next_transaction(&mut self, response: Sender<CommandResult>) -> f64 {
        self.transaction_count += 1;
        let transaction_id = self.transaction_count as f64;
        trace!(transaction_id, "registering transaction");
        self.transactions.push(Transaction {
            transaction_id,
            response,
        });
        transaction_id
    }

    fn register_expected(&mut self, stream_id: u32, name: String, response: Sender<CommandResult>) {
        trace!(stream_id, name = %name, "registering expected command");
        self.expected.push(ExpectedCommand {
            stream_id,
            name,
            response,
        });
    }

    fn dispatch(&mut self, command: Amf0Command, mstream: u32) {
        let Amf0Command {
            name,
            transaction_id,
            args,
        } = command;

        if !transaction_id.is_finite() || transaction_id < 0.0 || transaction_id > u32::MAX as f64
        {
            warn!(
                command = %name,
                transaction_id,
                "server sent command with extreme transaction ID"
            );
        } else if transaction_id > self.transaction_count as f64 {
            warn!(
                command = %name,
                transaction_id,
                count = self.transaction_count,
                "server sent command with unused transaction ID"
            );
            self.transaction_count = transaction_id as u32;
        }

        let is_response = name == "_result" || name == "_error";

        if is_response {
            if transaction_id == 0.0 {
                warn!(command = %name, "server sent response without transaction");
                return;
            }

            if let Some(i) = self
                .transactions
                .iter()
                .position(|t| t.transaction_id == transaction_id)
            {
                let transaction = self.transactions.remove(i);
                let _ = transaction.response.send(CommandResult { name, args });
            }
            return;
        }

        if transaction_id != 0.0 {
            debug!(command = %name, "server sent command expecting a reply");
        }

        if let Some(i) = self
            .expected
            .iter()
            .position(|e| e.stream_id == mstream && e.name == name)
        {
            let expected = self.expected.remove(i);
            let _ = expected.response.send(CommandResult { name, args });
        }
    }

    fn cancel_all(&mut self) {
        for transaction in self.transactions.drain(..) {
            trace!(
                transaction_id = transaction.transaction_id,
                "cancelling transaction"
            );
            let _ = transaction.response.send(CommandResult {
                name: COMMAND_CANCELLED.into(),
                args: Vec::new(),
            });
        }

        for expected in self.expected.drain(..) {
            trace!(name = %expected.name, "cancelling expected command");
            let _ = expected.response.send(CommandResult {
                name: COMMAND_CANCELLED.into(),
                args: Vec::new(),
            });
        }
    }
}

/// The socket, optionally wrapped in TLS.
pub(crate) enum NetStream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl NetStream {
    pub(crate) fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain(s) => s,
            NetStream::Tls(s) => s.get_ref(),
        }
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            NetStream::Plain(s) => s.read(buf),
            NetStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            NetStream::Plain(s) => s.write(buf),
            NetStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            NetStream::Plain(s) => s.flush(),
            NetStream::Tls(s) => s.flush(),
        }
    }
}

/// Thread-safe surface of a connection. All mutation funnels through one
/// FIFO queue, so submission order is emission order.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    control_tx: Sender<ControlItem>,
    cancel: Arc<AtomicBool>,
    stats: Arc<Mutex<ConnectionStats>>,
    output_ready_rx: Receiver<()>,
    socket: Arc<TcpStream>,
}

impl ConnectionHandle {
    /// Queue a message for transmission. Ownership moves to the loop.
    pub fn queue_message(&self, message: RtmpMessage) {
        let _ = self.control_tx.send(ControlItem::Message(message));
    }

    /// Send a command and register for its `_result`/`_error` reply.
    pub fn send_command(
        &self,
        stream_id: u32,
        name: &str,
        args: Vec<Amf0Value>,
    ) -> CommandReceiver {
        let (tx, rx) = bounded(1);
        let _ = self.control_tx.send(ControlItem::Command {
            stream_id,
            name: name.to_string(),
            args,
            response: Some(tx),
        });
        rx
    }

    /// Send a command without expecting a reply (transaction id 0).
    pub fn call_command(&self, stream_id: u32, name: &str, args: Vec<Amf0Value>) {
        let _ = self.control_tx.send(ControlItem::Command {
            stream_id,
            name: name.to_string(),
            args,
            response: None,
        });
    }

    /// Register for a server-initiated command such as `onStatus`;
    /// consumed on first match of (stream id, name).
    pub fn expect_command(&self, stream_id: u32, name: &str) -> CommandReceiver {
        let (tx, rx) = bounded(1);
        let _ = self.control_tx.send(ControlItem::Expect {
            stream_id,
            name: name.to_string(),
            response: tx,
        });
        rx
    }

    /// Queue a Data message with the `@setDataFrame` marker prepended, so
    /// servers register it as persistent stream metadata.
    pub fn set_data_frame(&self, message: RtmpMessage) {
        let _ = self.control_tx.send(ControlItem::SetDataFrame(message));
    }

    /// Request a new outbound chunk size; takes effect once the
    /// announcement has been transmitted.
    pub fn set_chunk_size(&self, chunk_size: u32) {
        self.queue_message(
            ProtocolControl {
                message_type: MessageType::SetChunkSize,
                param: chunk_size,
                param2: 0,
            }
            .into_message(),
        );
    }

    /// Announce the window acknowledgement size we expect the peer to honor.
    pub fn request_window_size(&self, window_ack_size: u32) {
        self.queue_message(
            ProtocolControl {
                message_type: MessageType::WindowAckSize,
                param: window_ack_size,
                param2: 0,
            }
            .into_message(),
        );
    }

    pub fn num_queued(&self) -> usize {
        self.control_tx.len()
    }

    /// Pulsed each time the loop dequeues a message for serialization;
    /// publishers use it to refill.
    pub fn output_ready(&self) -> Receiver<()> {
        self.output_ready_rx.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().unwrap().clone()
    }

    /// Idempotent; unblocks the loop and cancels pending work.
    pub fn close(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.control_tx.send(ControlItem::Close);
    }

    /// Apply SO_MAX_PACING_RATE to the socket; 0 kbps removes the limit.
    #[cfg(target_os = "linux")]
    pub fn set_pacing_rate(&self, peak_kbps: u32) -> Result<(), RtmpError> {
        use std::os::fd::AsRawFd;

        let rate: libc::c_int = if peak_kbps > 0 {
            (peak_kbps * 125) as libc::c_int
        } else {
            -1
        };

        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_MAX_PACING_RATE,
                &rate as *const _ as *const libc::c_void,
                std::mem::size_of_val(&rate) as libc::socklen_t,
            )
        };

        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        info!(rate, "set pacing rate");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_pacing_rate(&self, peak_kbps: u32) -> Result<(), RtmpError> {
        if peak_kbps > 0 {
            return Err(RtmpError::NotSupported(
                "SO_MAX_PACING_RATE is not supported".into(),
            ));
        }
        Ok(())
    }
}

fn set_data_frame_prefix() -> &'static Bytes {
    static PREFIX: OnceLock<Bytes> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Bytes::from(encode_amf0_values(&[Amf0Value::String("@setDataFrame".into())]))
    })
}

/// Reconstruct the peer's 64-bit acknowledged byte count from the 32-bit
/// counter it sends, detecting rollover.
fn extend_ack(last_acked: u64, bytes: u32) -> u64 {
    let last_low = last_acked as u32;
    let mut high = last_acked >> 32;

    if bytes < last_low {
        warn!(
            bytes,
            last_low, "acknowledgement bytes regression, assuming rollover"
        );
        high += 1;
    }

    (high << 32) | bytes as u64
}

/// Loop-thread state. Owns the socket, chunk tables and pending-command
/// lists exclusively; no lock is ever taken on them.
pub(crate) struct Connection {
    stream: NetStream,
    cancel: Arc<AtomicBool>,
    control_rx: Receiver<ControlItem>,
    events_tx: Sender<ConnectionEvent>,
    output_ready_tx: Sender<()>,
    stats: Arc<Mutex<ConnectionStats>>,

    input_buf: BytesMut,
    needed_bytes: usize,
    in_streams: ChunkStreams,
    out_streams: ChunkStreams,
    commands: CommandTable,

    out_chunk_size_pending: u32,
    out_window_ack_size_pending: u32,
    errored: bool,
}

impl Connection {
    /// Take ownership of a handshaken socket and spawn the loop thread.
    pub(crate) fn start(
        stream: NetStream,
    ) -> Result<(ConnectionHandle, Receiver<ConnectionEvent>, JoinHandle<()>), RtmpError> {
        stream.tcp().set_read_timeout(Some(READ_TIMEOUT))?;
        let socket = Arc::new(stream.tcp().try_clone()?);

        let (control_tx, control_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let (output_ready_tx, output_ready_rx) = bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ConnectionStats {
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            ..Default::default()
        }));

        let connection = Connection {
            stream,
            cancel: cancel.clone(),
            control_rx,
            events_tx,
            output_ready_tx,
            stats: stats.clone(),
            input_buf: BytesMut::with_capacity(2 * READ_SIZE),
            needed_bytes: 1,
            in_streams: ChunkStreams::new(),
            out_streams: ChunkStreams::new(),
            commands: CommandTable::default(),
            out_chunk_size_pending: 0,
            out_window_ack_size_pending: 0,
            errored: false,
        };

        let join = std::thread::Builder::new()
            .name("rtmp-connection".into())
            .spawn(move || connection.run())?;

        Ok((
            ConnectionHandle {
                control_tx,
                cancel,
                stats,
                output_ready_rx,
                socket,
            },
            events_rx,
            join,
        ))
    }

    fn stats(&self) -> MutexGuard<'_, ConnectionStats> {
        self.stats.lock().unwrap()
    }

    fn run(mut self) {
        debug!("connection loop starting");
        let mut read_buf = vec![0u8; READ_SIZE];

        'outer: while !self.cancel.load(Ordering::Relaxed) && !self.errored {
            loop {
                match self.control_rx.try_recv() {
                    Ok(ControlItem::Close) => break 'outer,
                    Ok(item) => self.handle_control(item),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
                if self.errored {
                    break 'outer;
                }
            }

            match self.stream.read(&mut read_buf) {
                Ok(0) => {
                    self.emit_error(RtmpError::ConnectionClosed);
                    break;
                }
                Ok(n) => {
                    trace!(n, "read bytes");
                    self.input_buf.extend_from_slice(&read_buf[..n]);

                    let (total, acked, window) = {
                        let mut stats = self.stats();
                        stats.in_bytes_total += n as u64;
                        (
                            stats.in_bytes_total,
                            stats.in_bytes_acked,
                            stats.in_window_ack_size,
                        )
                    };
                    if window > 0 && total - acked >= window as u64 {
                        self.send_ack();
                    }

                    if self.input_buf.len() >= self.needed_bytes {
                        self.process_input();
                    }
                }
                Err(err) if RtmpError::is_retryable_io(&err) => {}
                Err(err) => {
                    error!(%err, "read error");
                    self.emit_error(err.into());
                    break;
                }
            }
        }

        // commands still sitting in the queue get the same synthetic
        // cancellation as registered ones
        while let Ok(item) = self.control_rx.try_recv() {
            match item {
                ControlItem::Command {
                    response: Some(response),
                    ..
                }
                | ControlItem::Expect { response, .. } => {
                    let _ = response.send(CommandResult {
                        name: COMMAND_CANCELLED.into(),
                        args: Vec::new(),
                    });
                }
                _ => {}
            }
        }

        self.commands.cancel_all();
        let _ = self.events_tx.send(ConnectionEvent::Closed);
        debug!("connection loop exiting");
    }

    fn handle_control(&mut self, item: ControlItem) {
        match item {
            ControlItem::Message(message) => self.write_message(message),
            ControlItem::Command {
                stream_id,
                name,
                args,
                response,
            } => {
                debug!(command = %name, stream_id, "sending command");
                let transaction_id = match response {
                    Some(response) => self.commands.next_transaction(response),
                    None => 0.0,
                };

                let payload = encode_amf0_command(transaction_id, &name, &args);
                let message = RtmpMessage::new(
                    MessageType::CommandAmf0,
                    3,
                    stream_id,
                    Bytes::from(payload),
                );
                self.write_message(message);
            }
            ControlItem::Expect {
                stream_id,
                name,
                response,
            } => self.commands.register_expected(stream_id, name, response),
            ControlItem::SetDataFrame(mut message) => {
                let prefix = set_data_frame_prefix();
                let mut payload = BytesMut::with_capacity(prefix.len() + message.payload.len());
                payload.extend_from_slice(prefix);
                payload.extend_from_slice(&message.payload);
                message.payload = payload.freeze();
                self.write_message(message);
            }
            ControlItem::Close => unreachable!("handled by the loop"),
        }
    }

    fn write_message(&mut self, message: RtmpMessage) {
        let _ = self.output_ready_tx.try_send(());

        if message.is_protocol_control() && !self.prepare_protocol_control(&message) {
            error!("failed to prepare protocol control message, dropping");
            return;
        }

        let out_chunk_size = self.stats().out_chunk_size;

        let cstream = match self.out_streams.get(message.cstream) {
            Ok(cstream) => cstream,
            Err(err) => {
                error!(%err, "failed to get chunk stream, dropping message");
                return;
            }
        };

        let chunks = match cstream.serialize_all(&message, out_chunk_size) {
            Ok(chunks) => chunks,
            Err(err) => {
                error!(%err, "failed to serialize message, dropping");
                return;
            }
        };

        trace!(len = chunks.len(), "writing serialized chunks");

        match self.stream.write_all(&chunks).and_then(|_| self.stream.flush()) {
            Ok(()) => {
                self.stats().out_bytes_total += chunks.len() as u64;
                self.apply_protocol_control();
            }
            Err(err) => {
                error!(%err, "write error");
                self.emit_error(err.into());
            }
        }
    }

    /// Chunk size and window announcements we send must only take effect
    /// once their bytes are on the wire; stage them here and promote in
    /// `apply_protocol_control` after the write completes.
    fn prepare_protocol_control(&mut self, message: &RtmpMessage) -> bool {
        let Some(pc) = ProtocolControl::parse(message) else {
            return false;
        };

        match pc.message_type {
            MessageType::SetChunkSize => {
                let chunk_size = pc.param;
                info!(chunk_size, "pending chunk size");

                if !(MINIMUM_CHUNK_SIZE..=MAXIMUM_CHUNK_SIZE).contains(&chunk_size) {
                    error!(chunk_size, "requested chunk size out of bounds");
                    return false;
                }
                if chunk_size < DEFAULT_CHUNK_SIZE {
                    warn!(chunk_size, "requesting small chunk size");
                }

                self.out_chunk_size_pending = chunk_size;
            }
            MessageType::WindowAckSize => {
                let window_ack_size = pc.param;
                info!(window_ack_size, "pending window ack size");

                if window_ack_size < DEFAULT_WINDOW_ACK_SIZE {
                    warn!(window_ack_size, "requesting small window ack size");
                }

                self.out_window_ack_size_pending = window_ack_size;
            }
            _ => {}
        }

        true
    }

    fn apply_protocol_control(&mut self) {
        if self.out_chunk_size_pending != 0 {
            let chunk_size = self.out_chunk_size_pending;
            self.out_chunk_size_pending = 0;
            self.stats().out_chunk_size = chunk_size;
            info!(chunk_size, "applied chunk size");
        }

        if self.out_window_ack_size_pending != 0 {
            let window_ack_size = self.out_window_ack_size_pending;
            self.out_window_ack_size_pending = 0;
            self.stats().out_window_ack_size = window_ack_size;
            info!(window_ack_size, "applied window ack size");
        }
    }

    fn process_input(&mut self) {
        loop {
            let id = match parse_id(&self.input_buf) {
                IdParse::Id(id) => id,
                IdParse::NeedBytes(_) => {
                    self.needed_bytes = self.input_buf.len() + 1;
                    break;
                }
            };

            let in_chunk_size = self.stats().in_chunk_size;

            let cstream = match self.in_streams.get(id) {
                Ok(cstream) => cstream,
                Err(err) => {
                    self.emit_error(err);
                    return;
                }
            };

            let header_size = cstream.parse_header(&self.input_buf);
            if self.input_buf.len() < header_size {
                self.needed_bytes = header_size;
                break;
            }

            let payload_size = cstream.parse_payload(in_chunk_size) as usize;
            if self.input_buf.len() < header_size + payload_size {
                self.needed_bytes = header_size + payload_size;
                break;
            }

            let next = cstream.wrote_payload(
                &self.input_buf[header_size..header_size + payload_size],
                in_chunk_size,
            );

            let _ = self.input_buf.split_to(header_size + payload_size);
            self.needed_bytes = 1;

            if next == 0 {
                let message = cstream.parse_finish();
                self.handle_message(message);
                if self.errored {
                    return;
                }
            }
        }
    }

    fn handle_message(&mut self, message: RtmpMessage) {
        if message.is_protocol_control() {
            self.handle_protocol_control(&message);
            return;
        }

        if message.is_user_control() {
            self.handle_user_control(&message);
            return;
        }

        match message.message_type {
            MessageType::CommandAmf0 => {
                if let Some(command) = decode_amf0_command(&message.payload) {
                    debug!(
                        command = %command.name,
                        transaction_id = command.transaction_id,
                        size = message.size(),
                        "got command message"
                    );
                    self.commands.dispatch(command, message.mstream);
                }
            }
            MessageType::Aggregate => {
                trace!("got aggregate message");
                for submessage in split_aggregate(&message) {
                    self.handle_message(submessage);
                }
            }
            _ => {
                let _ = self.events_tx.send(ConnectionEvent::Message(message));
            }
        }
    }

    fn handle_protocol_control(&mut self, message: &RtmpMessage) {
        let Some(pc) = ProtocolControl::parse(message) else {
            error!("can't parse protocol control message");
            return;
        };

        match pc.message_type {
            MessageType::SetChunkSize => {
                info!(chunk_size = pc.param, "incoming chunk size");
                self.handle_set_chunk_size(pc.param);
            }
            MessageType::Abort => {
                error!(stream_id = pc.param, "unimplemented: chunk abort");
            }
            MessageType::Acknowledgement => {
                debug!(bytes = pc.param, "acknowledgement");
                let mut stats = self.stats();
                let new_ack = extend_ack(stats.out_bytes_acked, pc.param);
                trace!(acked = new_ack - stats.out_bytes_acked, "peer acknowledged bytes");
                stats.out_bytes_acked = new_ack;
            }
            MessageType::WindowAckSize => {
                info!(window_ack_size = pc.param, "incoming window ack size");
                if pc.param < DEFAULT_WINDOW_ACK_SIZE {
                    warn!(window_ack_size = pc.param, "peer requested small window ack size");
                }
                self.stats().in_window_ack_size = pc.param;
            }
            MessageType::SetPeerBandwidth => {
                debug!(bandwidth = pc.param, limit_type = pc.param2, "set peer bandwidth");
                // not correct, but close enough: answer by requesting the
                // same window, ignoring the limit type
                self.write_message(
                    ProtocolControl {
                        message_type: MessageType::WindowAckSize,
                        param: pc.param,
                        param2: 0,
                    }
                    .into_message(),
                );
            }
            other => {
                error!(ty = ?other, "unimplemented protocol control type");
            }
        }
    }

    fn handle_set_chunk_size(&mut self, chunk_size: u32) {
        if !(MINIMUM_CHUNK_SIZE..=MAXIMUM_CHUNK_SIZE).contains(&chunk_size) {
            error!(chunk_size, "peer requested chunk size out of bounds");
            return;
        }

        if chunk_size < DEFAULT_CHUNK_SIZE {
            warn!(chunk_size, "peer requested small chunk size");
        }

        self.stats().in_chunk_size = chunk_size;
    }

    fn handle_user_control(&mut self, message: &RtmpMessage) {
        let Some(uc) = UserControl::parse(message) else {
            error!("can't parse user control message");
            return;
        };

        match uc.event_type {
            UserControlType::StreamBegin
            | UserControlType::StreamEof
            | UserControlType::StreamDry
            | UserControlType::StreamIsRecorded => {
                info!(stream_id = uc.param, event = ?uc.event_type, "stream control");
                let _ = self.events_tx.send(ConnectionEvent::StreamControl {
                    event_type: uc.event_type,
                    stream_id: uc.param,
                });
            }
            UserControlType::SetBufferLength => {
                debug!(stream_id = uc.param, ms = uc.param2, "ignoring set buffer length");
            }
            UserControlType::PingRequest => {
                debug!(data = uc.param, "ping request");
                self.write_message(
                    UserControl {
                        event_type: UserControlType::PingResponse,
                        param: uc.param,
                        param2: 0,
                    }
                    .into_message(),
                );
            }
            UserControlType::PingResponse => {
                debug!(data = uc.param, "ignoring ping response");
            }
            UserControlType::BufferEmpty => {
                trace!(stream_id = uc.param, "ignoring buffer empty");
            }
            UserControlType::BufferReady => {
                trace!(stream_id = uc.param, "ignoring buffer ready");
            }
            other => {
                error!(event = ?other, "unimplemented user control type");
            }
        }
    }

    fn send_ack(&mut self) {
        let in_bytes_total = self.stats().in_bytes_total;

        self.write_message(
            ProtocolControl {
                message_type: MessageType::Acknowledgement,
                param: in_bytes_total as u32,
                param2: 0,
            }
            .into_message(),
        );

        self.stats().in_bytes_acked = in_bytes_total;
    }

    fn emit_error(&mut self, err: RtmpError) {
        if self.errored {
            return;
        }
        self.errored = true;

        error!(%err, "connection error");
        self.commands.cancel_all();
        let _ = self.events_tx.send(ConnectionEvent::Error(Arc::new(err)));
    }
}
