use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, after, never, select};
use md5::{Digest, Md5};
use rand::RngCore;
use tracing::{debug, info, trace, warn};

use crate::amf0::Amf0Value;
use crate::connection::{
    CommandReceiver, CommandResult, Connection, ConnectionEvent, ConnectionHandle,
    ConnectionStats, NetStream,
};
use crate::error::RtmpError;
use crate::flv::{FlvToRtmp, RtmpToFlv};
use crate::handshake::client_handshake;
use crate::location::{AuthMod, RtmpLocation, Scheme, StopCommands};
use crate::message::{
    DEFAULT_WINDOW_ACK_SIZE, RtmpMessage, UserControl, UserControlType,
};

/// Flag values for the audioCodecs connect property. The sum matches what
/// libavformat announces: all codecs minus the two reserved entries.
const CONNECT_AUDIOCODECS: f64 = 4071.0;
/// videoCodecs per libavformat: all codecs minus the obsolete entries.
const CONNECT_VIDEOCODECS: f64 = 252.0;
/// videoFunction: client can perform frame-accurate seeks.
const CONNECT_VIDEOFUNCTION: f64 = 1.0;
/// capabilities magic number sent by libavformat.
const CONNECT_CAPABILITIES: f64 = 15.0;

enum AttemptOutcome {
    Connected {
        handle: ConnectionHandle,
        events: Receiver<ConnectionEvent>,
        join: JoinHandle<()>,
    },
    RetryAdobe,
    RetryQuery(String),
}

enum ConnectDecision {
    Success,
    RetryAdobe,
    RetryQuery(String),
}

/// A connected RTMP client, past handshake and the `connect` exchange.
#[derive(Debug)]
pub struct RtmpClient {
    location: RtmpLocation,
    handle: ConnectionHandle,
    events: Receiver<ConnectionEvent>,
    join: Option<JoinHandle<()>>,
}

impl RtmpClient {
    /// Establish a connection: socket, optional TLS, handshake, `connect`
    /// command, and any adobe-auth or secure-token round trips.
    pub fn connect(location: RtmpLocation) -> Result<RtmpClient, RtmpError> {
        location.validate()?;

        let mut location = location;
        let mut auth_query: Option<String> = None;

        // auto mode may first switch to adobe, then retry once more with
        // the computed credentials query
        for _ in 0..4 {
            match Self::attempt(&location, auth_query.as_deref())? {
                AttemptOutcome::Connected {
                    handle,
                    events,
                    join,
                } => {
                    return Ok(RtmpClient {
                        location,
                        handle,
                        events,
                        join: Some(join),
                    });
                }
                AttemptOutcome::RetryAdobe => {
                    info!("reconnecting with authmod=adobe");
                    location.authmod = AuthMod::Adobe;
                }
                AttemptOutcome::RetryQuery(query) => {
                    debug!("reconnecting with auth query");
                    auth_query = Some(query);
                }
            }
        }

        Err(RtmpError::PermissionDenied(
            "too many authentication attempts".into(),
        ))
    }

    fn attempt(
        location: &RtmpLocation,
        auth_query: Option<&str>,
    ) -> Result<AttemptOutcome, RtmpError> {
        let app = location.application.clone();
        let uri = location.url(false);

        let (appstr, uristr) = if let Some(query) = auth_query {
            (format!("{app}?{query}"), format!("{uri}?{query}"))
        } else if location.authmod == AuthMod::Adobe {
            let user = location
                .username
                .as_deref()
                .ok_or_else(|| {
                    RtmpError::PermissionDenied("no username for adobe authentication".into())
                })?;
            if location.password.is_none() {
                return Err(RtmpError::PermissionDenied(
                    "no password for adobe authentication".into(),
                ));
            }
            (
                format!("{app}?authmod=adobe&user={user}"),
                format!("{uri}?authmod=adobe&user={user}"),
            )
        } else {
            (app, uri)
        };

        let mut stream = connect_stream(location)?;
        client_handshake(&mut stream, false)?;

        let (handle, events, join) = Connection::start(stream)?;

        // connect argument object; field order matters to some servers
        let mut fields = vec![("app".to_string(), Amf0Value::String(appstr))];
        if location.publish {
            fields.push(("type".into(), Amf0Value::String("nonprivate".into())));
        }
        if let Some(flash_ver) = &location.flash_ver {
            fields.push(("flashVer".into(), Amf0Value::String(flash_ver.clone())));
        }
        fields.push(("tcUrl".into(), Amf0Value::String(uristr)));
        if !location.publish {
            fields.push(("fpad".into(), Amf0Value::Boolean(false)));
            fields.push(("capabilities".into(), Amf0Value::Number(CONNECT_CAPABILITIES)));
            fields.push(("audioCodecs".into(), Amf0Value::Number(CONNECT_AUDIOCODECS)));
            fields.push(("videoCodecs".into(), Amf0Value::Number(CONNECT_VIDEOCODECS)));
            fields.push((
                "videoFunction".into(),
                Amf0Value::Number(CONNECT_VIDEOFUNCTION),
            ));
        }

        let reply = handle.send_command(0, "connect", vec![Amf0Value::Object(fields)]);
        let result = match await_result(&reply, &events, location.timeout) {
            Ok(result) => result,
            Err(err) => {
                close_connection(&handle, join);
                return Err(err);
            }
        };

        match Self::handle_connect_result(location, &handle, result) {
            Ok(ConnectDecision::Success) => Ok(AttemptOutcome::Connected {
                handle,
                events,
                join,
            }),
            Ok(ConnectDecision::RetryAdobe) => {
                close_connection(&handle, join);
                Ok(AttemptOutcome::RetryAdobe)
            }
            Ok(ConnectDecision::RetryQuery(query)) => {
                close_connection(&handle, join);
                Ok(AttemptOutcome::RetryQuery(query))
            }
            Err(err) => {
                close_connection(&handle, join);
                Err(err)
            }
        }
    }

    fn handle_connect_result(
        location: &RtmpLocation,
        handle: &ConnectionHandle,
        result: CommandResult,
    ) -> Result<ConnectDecision, RtmpError> {
        if result.args.len() < 2 {
            return Err(RtmpError::CommandFailed(
                "'connect' cmd failed; not enough return arguments".into(),
            ));
        }

        let optional_args = &result.args[1];
        let code = optional_args
            .field("code")
            .and_then(Amf0Value::as_str)
            .ok_or_else(|| {
                RtmpError::CommandFailed("'connect' cmd failed; no status code".into())
            })?;

        info!(code, "connect result");

        if code == "NetConnection.Connect.Success" {
            if let Some(challenge) = optional_args
                .field("secureToken")
                .and_then(Amf0Value::as_str)
            {
                let token = location
                    .secure_token
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        RtmpError::PermissionDenied(
                            "server requires secureToken but no token provided".into(),
                        )
                    })?;

                let response = tea_decode(token, challenge);
                debug!(%response, "sending secure token response");
                handle.call_command(
                    0,
                    "secureTokenResponse",
                    vec![Amf0Value::Null, Amf0Value::String(response)],
                );
            }

            return Ok(ConnectDecision::Success);
        }

        if code == "NetConnection.Connect.Rejected" {
            let desc = optional_args
                .field("description")
                .and_then(Amf0Value::as_str)
                .ok_or_else(|| {
                    RtmpError::PermissionDenied(format!(
                        "'connect' cmd returned '{code}'; no description"
                    ))
                })?;

            debug!(desc, "connect rejected");

            if location.authmod == AuthMod::Auto && desc.contains("code=403 need auth") {
                if desc.contains("authmod=adobe") {
                    return Ok(ConnectDecision::RetryAdobe);
                }
                return Err(RtmpError::PermissionDenied(format!(
                    "'connect' cmd returned unhandled authmod: {desc}"
                )));
            }

            let Some((authmod_str, query)) = parse_auth_reject(desc) else {
                return Err(RtmpError::PermissionDenied(format!(
                    "'connect' cmd returned '{code}': {desc}"
                )));
            };

            info!(authmod = %authmod_str, query = %query, "parsed auth request");

            let matches = location.authmod == AuthMod::Adobe && authmod_str == "adobe";
            if !matches {
                return Err(RtmpError::PermissionDenied(format!(
                    "server uses wrong authentication mode '{authmod_str}'; expected {}",
                    location.authmod.as_str()
                )));
            }

            let reason = query_value(&query, "reason").ok_or_else(|| {
                RtmpError::PermissionDenied(format!("authentication failed; no reason: {desc}"))
            })?;

            if reason == "authfailed" {
                return Err(RtmpError::PermissionDenied(format!(
                    "authentication failed; wrong credentials?: {desc}"
                )));
            }
            if reason != "needauth" {
                return Err(RtmpError::PermissionDenied(format!(
                    "authentication failed; reason '{reason}': {desc}"
                )));
            }

            let salt = query_value(&query, "salt").ok_or_else(|| {
                RtmpError::PermissionDenied(format!("salt missing from auth request: {desc}"))
            })?;
            let opaque = query_value(&query, "opaque");
            let challenge = query_value(&query, "challenge");

            let auth_query = do_adobe_auth(
                location.username.as_deref().unwrap_or(""),
                location.password.as_deref().unwrap_or(""),
                &salt,
                opaque.as_deref(),
                challenge.as_deref(),
            );

            return Ok(ConnectDecision::RetryQuery(auth_query));
        }

        Err(RtmpError::CommandFailed(format!(
            "'connect' cmd returned '{code}'"
        )))
    }

    pub fn location(&self) -> &RtmpLocation {
        &self.location
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn events(&self) -> &Receiver<ConnectionEvent> {
        &self.events
    }

    pub fn stats(&self) -> ConnectionStats {
        self.handle.stats()
    }

    /// Create a stream and publish on it. Returns the stream id.
    pub fn start_publish(&self) -> Result<u32, RtmpError> {
        let stream = self.stream_name()?;

        // not part of the RTMP documentation, but expected by FMS-style
        // servers before a publish
        debug!(stream = %stream, "releasing stream");
        self.handle.call_command(
            0,
            "releaseStream",
            vec![Amf0Value::Null, Amf0Value::String(stream.clone())],
        );
        self.handle.call_command(
            0,
            "FCPublish",
            vec![Amf0Value::Null, Amf0Value::String(stream.clone())],
        );

        let stream_id = self.create_stream()?;

        let status = self.handle.expect_command(stream_id, "onStatus");
        info!(stream = %stream, stream_id, "sending publish");
        self.handle.call_command(
            stream_id,
            "publish",
            vec![
                Amf0Value::Null,
                Amf0Value::String(stream),
                Amf0Value::String("live".into()),
            ],
        );

        self.wait_status(status, true)?;
        Ok(stream_id)
    }

    /// Create a stream and start playback. Returns the stream id.
    pub fn start_play(&self) -> Result<u32, RtmpError> {
        let stream = self.stream_name()?;

        // matches librtmp
        self.handle.request_window_size(DEFAULT_WINDOW_ACK_SIZE);
        self.send_set_buffer_length(0, 300);

        let stream_id = self.create_stream()?;

        let status = self.handle.expect_command(stream_id, "onStatus");
        info!(stream = %stream, stream_id, "sending play");
        self.handle.call_command(
            stream_id,
            "play",
            vec![
                Amf0Value::Null,
                Amf0Value::String(stream),
                // -2: play a live stream, or a recording if no live one exists
                Amf0Value::Number(-2.0),
            ],
        );
        self.send_set_buffer_length(stream_id, 30000);

        self.wait_status(status, false)?;
        Ok(stream_id)
    }

    /// Send the configured subset of the stop commands, fire-and-forget.
    pub fn stop_publish(&self, stop_commands: StopCommands) {
        let Ok(stream) = self.stream_name() else {
            return;
        };

        for (flag, name) in [
            (StopCommands::FC_UNPUBLISH, "FCUnpublish"),
            (StopCommands::CLOSE_STREAM, "closeStream"),
            (StopCommands::DELETE_STREAM, "deleteStream"),
        ] {
            if stop_commands.contains(flag) {
                debug!(command = name, stream = %stream, "sending stop command");
                self.handle.call_command(
                    0,
                    name,
                    vec![Amf0Value::Null, Amf0Value::String(stream.clone())],
                );
            }
        }
    }

    /// Start publishing and wrap the client in a publisher that accepts
    /// FLV-muxed buffers.
    pub fn into_publisher(self) -> Result<Publisher, RtmpError> {
        let stream_id = self.start_publish()?;
        Ok(Publisher {
            client: self,
            stream_id,
            adapter: FlvToRtmp::new(),
            headers: Vec::new(),
        })
    }

    /// Start playback and wrap the client in a player that yields
    /// FLV-framed buffers.
    pub fn into_player(self, idle_timeout: u32, no_eof_is_error: bool) -> Result<Player, RtmpError> {
        let stream_id = self.start_play()?;
        Ok(Player {
            client: self,
            stream_id,
            adapter: RtmpToFlv::new(),
            idle_timeout,
            no_eof_is_error,
            finished: false,
        })
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    fn stream_name(&self) -> Result<String, RtmpError> {
        if self.location.stream.is_empty() {
            return Err(RtmpError::NotInitialized("Stream"));
        }
        Ok(self.location.stream.clone())
    }

    fn send_set_buffer_length(&self, stream_id: u32, ms: u32) {
        self.handle.queue_message(
            UserControl {
                event_type: UserControlType::SetBufferLength,
                param: stream_id,
                param2: ms,
            }
            .into_message(),
        );
    }

    fn create_stream(&self) -> Result<u32, RtmpError> {
        info!(stream = %self.location.stream, "creating stream");
        let reply = self
            .handle
            .send_command(0, "createStream", vec![Amf0Value::Null]);

        let result = await_result(&reply, &self.events, self.location.timeout)?;
        if result.args.len() < 2 {
            return Err(RtmpError::CommandFailed(
                "'createStream' cmd failed; not enough return arguments".into(),
            ));
        }

        let Some(id) = result.args[1].as_number() else {
            return Err(RtmpError::CommandFailed(format!(
                "'createStream' cmd failed: {}: {:?}",
                result.name, result.args[1]
            )));
        };

        info!(stream_id = id, "createStream success");

        if id == 0.0 {
            return Err(RtmpError::InvalidData(
                "'createStream' cmd returned ID 0".into(),
            ));
        }

        Ok(id as u32)
    }

    fn wait_status(&self, status: CommandReceiver, publish: bool) -> Result<(), RtmpError> {
        let command = if publish { "publish" } else { "play" };
        let result = await_result(&status, &self.events, self.location.timeout)?;

        if result.args.len() < 2 {
            return Err(RtmpError::CommandFailed(format!(
                "'{command}' cmd failed; not enough return arguments"
            )));
        }

        let info = &result.args[1];
        let code = info.field("code").and_then(Amf0Value::as_str).unwrap_or("");

        if publish {
            match code {
                "NetStream.Publish.Start" => {
                    info!(code, "publish success");
                    return Ok(());
                }
                "NetStream.Publish.BadName" => {
                    return Err(RtmpError::AlreadyExists(format!(
                        "publish denied; stream already exists: {info:?}"
                    )));
                }
                "NetStream.Publish.Denied" => {
                    return Err(RtmpError::PermissionDenied(format!(
                        "publish denied: {info:?}"
                    )));
                }
                _ => {}
            }
        } else {
            match code {
                "NetStream.Play.Start" | "NetStream.Play.PublishNotify"
                | "NetStream.Play.Reset" => {
                    info!(code, "play success");
                    return Ok(());
                }
                "NetStream.Play.StreamNotFound" => {
                    return Err(RtmpError::NotFound(format!(
                        "play denied; stream not found: {info:?}"
                    )));
                }
                _ => {}
            }
        }

        Err(RtmpError::CommandFailed(format!(
            "'{command}' cmd failed: {}: {info:?}",
            result.name
        )))
    }
}

impl Drop for RtmpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Publishing session: feeds FLV buffers through the adapter and out over
/// the connection, with streamheader replay and queue backpressure.
pub struct Publisher {
    client: RtmpClient,
    stream_id: u32,
    adapter: FlvToRtmp,
    headers: Vec<RtmpMessage>,
}

impl Publisher {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.client.handle
    }

    pub fn stats(&self) -> ConnectionStats {
        self.client.stats()
    }

    /// Cache a streamheader buffer; replayed to the server immediately
    /// before the first media message.
    pub fn add_stream_header(&mut self, data: &[u8]) -> Result<(), RtmpError> {
        if let Some(message) = self.adapter.buffer_to_message(data)? {
            debug!(size = message.size(), "caching streamheader message");
            self.headers.push(message);
        }
        Ok(())
    }

    /// Queue one FLV-muxed buffer. Blocks while more than a few messages
    /// are already waiting, pacing the producer against the socket.
    pub fn send_buffer(&mut self, data: &[u8]) -> Result<(), RtmpError> {
        let Some(message) = self.adapter.buffer_to_message(data)? else {
            return Ok(());
        };

        let output_ready = self.client.handle.output_ready();
        while self.client.handle.num_queued() > 3 {
            select! {
                recv(output_ready) -> _ => {}
                recv(self.client.events) -> event => match event {
                    Ok(ConnectionEvent::Error(err)) => return Err(surface_error(&err)),
                    Ok(ConnectionEvent::Closed) | Err(_) => {
                        return Err(RtmpError::ConnectionClosed);
                    }
                    Ok(_) => {}
                },
            }
        }

        for header in self.headers.drain(..) {
            send_media(&self.client.handle, header, self.stream_id);
        }
        send_media(&self.client.handle, message, self.stream_id);
        Ok(())
    }

    /// Send the configured stop commands and tear the connection down.
    pub fn stop(self, stop_commands: StopCommands) {
        if !stop_commands.is_empty() {
            self.client.stop_publish(stop_commands);
        }
        self.client.close();
    }
}

fn send_media(handle: &ConnectionHandle, mut message: RtmpMessage, stream_id: u32) {
    message.mstream = stream_id;
    if message.is_metadata() {
        handle.set_data_frame(message);
    } else {
        handle.queue_message(message);
    }
}

/// Playback session: yields FLV-framed buffers from the played stream.
pub struct Player {
    client: RtmpClient,
    stream_id: u32,
    adapter: RtmpToFlv,
    idle_timeout: u32,
    no_eof_is_error: bool,
    finished: bool,
}

impl Player {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn stats(&self) -> ConnectionStats {
        self.client.stats()
    }

    /// The next FLV buffer, or `None` at end of stream. An idle timeout
    /// converts to end-of-stream, not an error; a connection failure is an
    /// error only when `no_eof_is_error` is set.
    pub fn next_buffer(&mut self) -> Result<Option<Bytes>, RtmpError> {
        if self.finished {
            return Ok(None);
        }

        let idle = if self.idle_timeout > 0 {
            after(Duration::from_secs(self.idle_timeout as u64))
        } else {
            never()
        };

        loop {
            select! {
                recv(self.client.events) -> event => match event {
                    Ok(ConnectionEvent::Message(message)) => {
                        if message.mstream != self.stream_id {
                            debug!(
                                mstream = message.mstream,
                                stream_id = self.stream_id,
                                "ignoring message for other stream"
                            );
                            continue;
                        }
                        if let Some(buffer) = self.adapter.message_to_buffer(&message) {
                            return Ok(Some(buffer));
                        }
                    }
                    Ok(ConnectionEvent::StreamControl { event_type, stream_id }) => {
                        info!(?event_type, stream_id, "stream control");
                        if event_type == UserControlType::StreamEof
                            && stream_id == self.stream_id
                        {
                            info!("went EOS");
                            self.finished = true;
                            return Ok(None);
                        }
                    }
                    Ok(ConnectionEvent::Error(err)) => {
                        self.finished = true;
                        if self.no_eof_is_error {
                            return Err(surface_error(&err));
                        }
                        debug!(%err, "connection error mapped to end of stream");
                        return Ok(None);
                    }
                    Ok(ConnectionEvent::Closed) | Err(_) => {
                        self.finished = true;
                        if self.no_eof_is_error {
                            return Err(RtmpError::ConnectionClosed);
                        }
                        return Ok(None);
                    }
                },
                recv(idle) -> _ => {
                    debug!("idle timeout, end of stream");
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }

    pub fn close(self) {
        self.client.close();
    }
}

fn connect_stream(location: &RtmpLocation) -> Result<NetStream, RtmpError> {
    let timeout = Duration::from_secs(location.timeout as u64);

    debug!(host = %location.host, port = location.port, "starting socket connection");

    let addrs: Vec<_> = (location.host.as_str(), location.port)
        .to_socket_addrs()?
        .collect();

    let mut last_err: Option<std::io::Error> = None;
    let mut tcp = None;
    for addr in addrs {
        let result = if location.timeout > 0 {
            TcpStream::connect_timeout(&addr, timeout)
        } else {
            TcpStream::connect(addr)
        };
        match result {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => last_err = Some(err),
        }
    }

    let tcp = match (tcp, last_err) {
        (Some(tcp), _) => tcp,
        (None, Some(err)) => {
            return Err(match err.kind() {
                std::io::ErrorKind::ConnectionRefused => RtmpError::ConnectionRefused,
                std::io::ErrorKind::TimedOut => RtmpError::TimedOut,
                _ => err.into(),
            });
        }
        (None, None) => {
            return Err(RtmpError::InvalidData(format!(
                "no addresses for host {}",
                location.host
            )));
        }
    };

    if location.timeout > 0 {
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;
    }

    debug!("socket connection established");

    match location.scheme {
        Scheme::Rtmp => Ok(NetStream::Plain(tcp)),
        Scheme::Rtmps => tls_stream(location, tcp),
    }
}

fn tls_stream(location: &RtmpLocation, tcp: TcpStream) -> Result<NetStream, RtmpError> {
    debug!(flags = location.tls_flags.bits(), "configuring TLS");

    let config = if location.tls_flags.validates_all() {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        if !native.errors.is_empty() {
            warn!(errors = native.errors.len(), "some native certificates failed to load");
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        trace!(added, ignored, "loaded native root certificates");

        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        warn!("TLS certificate validation disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new()))
            .with_no_client_auth()
    };

    let server_name = rustls::pki_types::ServerName::try_from(location.host.clone())
        .map_err(|e| RtmpError::InvalidData(format!("invalid TLS server name: {e}")))?;

    let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| RtmpError::InvalidData(format!("TLS setup failed: {e}")))?;

    Ok(NetStream::Tls(Box::new(rustls::StreamOwned::new(conn, tcp))))
}

#[derive(Debug)]
struct NoCertificateVerification {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoCertificateVerification {
    fn new() -> NoCertificateVerification {
        NoCertificateVerification {
            schemes: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

fn close_connection(handle: &ConnectionHandle, join: JoinHandle<()>) {
    handle.close();
    let _ = join.join();
}

/// Wait for a command reply. The reply fires exactly once even on
/// connection failure (a synthetic cancellation), so the event channel is
/// only consulted afterwards to surface the underlying error.
fn await_result(
    reply: &CommandReceiver,
    events: &Receiver<ConnectionEvent>,
    timeout_secs: u32,
) -> Result<CommandResult, RtmpError> {
    let result = if timeout_secs > 0 {
        reply.recv_timeout(Duration::from_secs(timeout_secs as u64))
    } else {
        reply.recv().map_err(|_| RecvTimeoutError::Disconnected)
    };

    match result {
        Ok(result) if result.is_cancelled() => Err(connection_failure(events)),
        Ok(result) => Ok(result),
        Err(RecvTimeoutError::Timeout) => Err(RtmpError::TimedOut),
        Err(RecvTimeoutError::Disconnected) => Err(connection_failure(events)),
    }
}

/// The connection cancelled our command; dig the actual error out of the
/// event channel. The connection is dead at this point, so draining it
/// loses nothing of value.
fn connection_failure(events: &Receiver<ConnectionEvent>) -> RtmpError {
    for event in events.try_iter() {
        if let ConnectionEvent::Error(err) = event {
            return surface_error(&err);
        }
    }
    RtmpError::Cancelled
}

/// Best-effort clone of a shared loop error for propagation.
fn surface_error(err: &RtmpError) -> RtmpError {
    match err {
        RtmpError::ConnectionClosed => RtmpError::ConnectionClosed,
        RtmpError::ConnectionRefused => RtmpError::ConnectionRefused,
        RtmpError::Cancelled => RtmpError::Cancelled,
        RtmpError::TimedOut => RtmpError::TimedOut,
        RtmpError::Io(io) => RtmpError::Io(std::io::Error::new(io.kind(), io.to_string())),
        other => RtmpError::InvalidData(other.to_string()),
    }
}

/// Parse the rejection description of FMS-style auth:
/// `[ AccessManager.Reject ] : [ authmod=adobe ] : ?query...`
fn parse_auth_reject(desc: &str) -> Option<(String, String)> {
    let reject = desc.find("AccessManager.Reject")?;
    let rest = &desc[reject..];

    let authmod_at = rest.find("authmod=")?;
    let after_authmod = &rest[authmod_at + "authmod=".len()..];
    let bracket = after_authmod.find(']')?;
    let authmod = after_authmod[..bracket].trim().to_string();

    let query_at = after_authmod[bracket..].find('?')?;
    let query = after_authmod[bracket + query_at..].to_string();

    Some((authmod, query))
}

fn query_value(query: &str, key: &str) -> Option<String> {
    let query = query.strip_prefix('?').unwrap_or(query);
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn do_adobe_auth(
    username: &str,
    password: &str,
    salt: &str,
    opaque: Option<&str>,
    challenge: Option<&str>,
) -> String {
    let client_challenge = format!("{:08x}", rand::rng().next_u32());
    adobe_auth_query(username, password, salt, opaque, challenge, &client_challenge)
}

fn adobe_auth_query(
    username: &str,
    password: &str,
    salt: &str,
    opaque: Option<&str>,
    challenge: Option<&str>,
    client_challenge: &str,
) -> String {
    let mut md5 = Md5::new();
    md5.update(username.as_bytes());
    md5.update(salt.as_bytes());
    md5.update(password.as_bytes());
    let hash1 = BASE64.encode(md5.finalize());

    let mut md5 = Md5::new();
    md5.update(hash1.as_bytes());
    if let Some(opaque) = opaque {
        md5.update(opaque.as_bytes());
    } else if let Some(challenge) = challenge {
        md5.update(challenge.as_bytes());
    }
    md5.update(client_challenge.as_bytes());
    let response = BASE64.encode(md5.finalize());

    let mut query = format!(
        "authmod=adobe&user={username}&challenge={client_challenge}&response={response}"
    );
    if let Some(opaque) = opaque {
        query.push_str("&opaque=");
        query.push_str(opaque);
    }
    query
}

/// Pack the first 16 bytes of the secure token as 4 little-endian words,
/// zero-padded.
fn tea_prep_key(key: &str) -> [u32; 4] {
    let mut bytes = [0u8; 16];
    let src = key.as_bytes();
    let n = src.len().min(16);
    bytes[..n].copy_from_slice(&src[..n]);

    [
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
    ]
}

/// Hex text to little-endian words, 8 digits per word; stray or invalid
/// digits count as zero.
fn tea_prep_text(text: &str) -> Vec<u32> {
    let chars: Vec<u8> = text.bytes().collect();
    let mut words = Vec::with_capacity(chars.len().div_ceil(8));

    for group in chars.chunks(8) {
        let mut bytes = [0u8; 4];
        for (j, byte) in bytes.iter_mut().enumerate() {
            let hi = group
                .get(2 * j)
                .and_then(|&c| (c as char).to_digit(16))
                .unwrap_or(0);
            let lo = group
                .get(2 * j + 1)
                .and_then(|&c| (c as char).to_digit(16))
                .unwrap_or(0);
            *byte = ((hi << 4) + lo) as u8;
        }
        words.push(u32::from_le_bytes(bytes));
    }

    words
}

const TEA_DELTA: u32 = 0x9e37_79b9;

fn tea_mx(sum: u32, y: u32, z: u32, p: usize, e: u32, key: &[u32; 4]) -> u32 {
    (((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4)))
        ^ ((sum ^ y).wrapping_add(key[(p & 3) ^ e as usize] ^ z))
}

/// Corrected block TEA decryption, in place.
fn tea_btea_decode(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n == 0 {
        return;
    }

    let q = 6 + 52 / n as u32;
    let mut sum = q.wrapping_mul(TEA_DELTA);
    let mut y = v[0];
    let mut z;

    while sum != 0 {
        let e = (sum >> 2) & 3;

        for p in (1..n).rev() {
            z = v[p - 1];
            v[p] = v[p].wrapping_sub(tea_mx(sum, y, z, p, e, key));
            y = v[p];
        }

        z = v[n - 1];
        v[0] = v[0].wrapping_sub(tea_mx(sum, y, z, 0, e, key));
        y = v[0];

        sum = sum.wrapping_sub(TEA_DELTA);
    }
}

/// Decode a secure-token challenge: XXTEA over little-endian words keyed
/// by the token, yielding the response string.
fn tea_decode(key: &str, hex_text: &str) -> String {
    let k = tea_prep_key(key);
    let mut v = tea_prep_text(hex_text);
    if v.is_empty() {
        return String::new();
    }

    tea_btea_decode(&mut v, &k);

    let mut bytes = Vec::with_capacity(v.len() * 4);
    for word in v {
        bytes.extend_from_slice(&word.to_le_bytes());
    }

    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
