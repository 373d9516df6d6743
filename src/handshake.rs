use std::io::{Read, Write};
use std::sync::OnceLock;
use std::time::Instant;

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::error::RtmpError;

const RTMP_VERSION: u8 = 3;
const SIZE_P0: usize = 1;
const SIZE_P1: usize = 1536;
const SIZE_P2: usize = SIZE_P1;
const SIZE_P0P1: usize = SIZE_P0 + SIZE_P1;
const SIZE_P0P1P2: usize = SIZE_P0P1 + SIZE_P2;
const SIZE_RANDOM: usize = SIZE_P1 - 8;

fn monotonic_ms() -> u32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u32
}

fn read_full<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<(), RtmpError> {
    let mut got = 0;
    while got < buf.len() {
        match stream.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(RtmpError::PartialInput {
                    wanted: buf.len(),
                    got,
                });
            }
            Ok(n) => got += n,
            Err(err) if RtmpError::is_retryable_io(&err) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Perform the client side of the RTMP handshake.
///
/// In strict mode a server echo that does not match our C1 padding fails the
/// handshake; by default the mismatch is only logged.
pub(crate) fn client_handshake<S>(stream: &mut S, strict: bool) -> Result<(), RtmpError>
where
    S: Read + Write,
{
    let mut random = [0u8; SIZE_RANDOM];
    rand::rng().fill_bytes(&mut random);
    client_handshake_with_random(stream, strict, &random)
}

fn client_handshake_with_random<S>(
    stream: &mut S,
    strict: bool,
    random: &[u8; SIZE_RANDOM],
) -> Result<(), RtmpError>
where
    S: Read + Write,
{
    info!("starting client handshake");

    // C0 version byte, then C1: time, four zero bytes, random padding
    let mut c0c1 = [0u8; SIZE_P0P1];
    c0c1[0] = RTMP_VERSION;
    c0c1[1..5].copy_from_slice(&monotonic_ms().to_be_bytes());
    c0c1[9..].copy_from_slice(random);

    stream.write_all(&c0c1)?;
    stream.flush()?;
    debug!("sent C0+C1, waiting for S0+S1+S2");

    let mut s0s1s2 = [0u8; SIZE_P0P1P2];
    read_full(stream, &mut s0s1s2)?;
    debug!("got S0+S1+S2");

    if s0s1s2[SIZE_P0P1 + 8..] == random[..] {
        debug!("S2 random data matches C1");
    } else if strict {
        return Err(RtmpError::InvalidData(
            "handshake response data did not match".into(),
        ));
    } else {
        warn!("handshake response data did not match; continuing anyway");
    }

    // C2 is S1 echoed back with our current time patched in
    let mut c2 = [0u8; SIZE_P2];
    c2.copy_from_slice(&s0s1s2[SIZE_P0..SIZE_P0P1]);
    c2[4..8].copy_from_slice(&monotonic_ms().to_be_bytes());

    stream.write_all(&c2)?;
    stream.flush()?;

    info!("client handshake finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    struct MockStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl MockStream {
        fn new(input: Vec<u8>) -> MockStream {
            MockStream {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn server_reply(random: &[u8; SIZE_RANDOM], echo_random: bool) -> Vec<u8> {
        let mut reply = vec![0u8; SIZE_P0P1P2];
        reply[0] = RTMP_VERSION;
        // S1: arbitrary recognizable padding
        for (i, b) in reply[SIZE_P0..SIZE_P0P1].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        if echo_random {
            reply[SIZE_P0P1 + 8..].copy_from_slice(random);
        }
        reply
    }

    #[test]
    fn handshake_round_trip() {
        let random = [0x5au8; SIZE_RANDOM];
        let reply = server_reply(&random, true);
        let s1 = reply[SIZE_P0..SIZE_P0P1].to_vec();

        let mut stream = MockStream::new(reply);
        client_handshake_with_random(&mut stream, true, &random).unwrap();

        // C0 + C1 + C2
        assert_eq!(stream.output.len(), SIZE_P0P1 + SIZE_P2);
        assert_eq!(stream.output[0], RTMP_VERSION);

        let c1 = &stream.output[SIZE_P0..SIZE_P0P1];
        assert_eq!(&c1[4..8], &[0, 0, 0, 0]);
        assert_eq!(&c1[8..], &random[..]);

        // C2 echoes S1 except for the patched time field
        let c2 = &stream.output[SIZE_P0P1..];
        assert_eq!(c2.len(), SIZE_P2);
        assert_eq!(&c2[..4], &s1[..4]);
        assert_eq!(&c2[8..], &s1[8..]);
    }

    #[test]
    fn strict_mode_rejects_mismatch() {
        let random = [0x11u8; SIZE_RANDOM];
        let reply = server_reply(&random, false);

        let mut stream = MockStream::new(reply);
        let err = client_handshake_with_random(&mut stream, true, &random).unwrap_err();
        assert!(matches!(err, RtmpError::InvalidData(_)));
    }

    #[test]
    fn lax_mode_tolerates_mismatch() {
        let random = [0x11u8; SIZE_RANDOM];
        let reply = server_reply(&random, false);

        let mut stream = MockStream::new(reply);
        client_handshake_with_random(&mut stream, false, &random).unwrap();
    }

    #[test]
    fn short_read_is_partial_input() {
        let random = [0u8; SIZE_RANDOM];
        let mut stream = MockStream::new(vec![RTMP_VERSION; 100]);

        let err = client_handshake_with_random(&mut stream, false, &random).unwrap_err();
        assert!(matches!(
            err,
            RtmpError::PartialInput {
                wanted: SIZE_P0P1P2,
                got: 100,
            }
        ));
    }
}
