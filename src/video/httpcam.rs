//! IP webcam client for servers offering HTTP MJPG streams.
//!
//! This is how the DroidCam app exposes a phone camera on the local network.

use std::{
    io::{self, prelude::*, BufRead, BufReader},
    net::{IpAddr, SocketAddr, TcpStream},
    time::Duration,
};

use anyhow::{bail, Context};

use crate::image::{Image, Resolution};
use crate::timer::Timer;

use super::{CameraInfo, CameraSource};

/// The port DroidCam serves its video stream on.
pub const DEFAULT_PORT: u16 = 4747;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A stalled server makes [`HttpStream::read`] fail after this long instead of blocking forever.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for the `Content-Length` of a single JPEG frame.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Parses `ip` or `ip:port` into a socket address, using [`DEFAULT_PORT`] if no port is given.
pub fn parse_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    addr.parse()
        .with_context(|| format!("invalid camera address '{addr}'"))
}

/// A `multipart/x-mixed-replace` MJPEG stream.
pub struct HttpStream<R = BufReader<TcpStream>> {
    stream: R,
    name: String,
    boundary: String,
    /// Whether the stream is positioned right after a boundary line.
    synced: bool,
    resolution: Option<Resolution>,
    t_dequeue: Timer,
    t_decode: Timer,
}

impl HttpStream {
    /// Connects to the server at `addr` and requests its `/video` stream.
    pub fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        write!(stream, "GET /video HTTP/1.1\r\nHost: {addr}\r\n\r\n")?;

        let this = Self::from_reader(BufReader::new(stream), format!("http://{addr}/video"))?;
        log::info!("connected to {}", this.name);
        Ok(this)
    }
}

impl<R: BufRead> HttpStream<R> {
    /// Reads the HTTP response headers from `stream` and prepares to read frames from it.
    ///
    /// `stream` must be positioned at the start of the server's HTTP response.
    pub fn from_reader(mut stream: R, name: String) -> anyhow::Result<Self> {
        let mut line = String::new();
        read_line(&mut stream, &mut line)?;
        log::trace!("response: {}", line.trim());
        if !line.starts_with("HTTP/1.1 200") && !line.starts_with("HTTP/1.0 200") {
            bail!("received unexpected response: {}", line.trim());
        }

        let mut boundary = None;
        loop {
            line.clear();
            read_line(&mut stream, &mut line)?;
            if line.trim().is_empty() {
                break;
            }
            log::trace!("response header: {}", line.trim());
            let Some((name, value)) = line.split_once(':') else {
                bail!("malformed HTTP response");
            };
            if name.eq_ignore_ascii_case("Content-Type") {
                boundary = Some(parse_content_type(value)?);
            }
        }

        let Some(boundary) = boundary else {
            bail!("missing `Content-Type` header");
        };

        let mut this = Self {
            stream,
            name,
            boundary,
            synced: false,
            resolution: None,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        };
        this.read_until_boundary()?;
        this.synced = true;
        Ok(this)
    }

    /// Reads and decodes the next JPEG frame of the stream.
    ///
    /// If reading a frame fails midway (for example because the server stalled and the read timed
    /// out), the rest of that frame is skipped by the next call.
    pub fn read(&mut self) -> anyhow::Result<Image> {
        let dequeue_guard = self.t_dequeue.start();
        if !self.synced {
            log::debug!("resynchronizing MJPEG stream");
            self.read_until_boundary()?;
            self.synced = true;
        }
        let buf = self.read_part().map_err(|e| {
            self.synced = false;
            e
        })?;
        drop(dequeue_guard);

        let image = self.t_decode.time(|| Image::decode_jpeg(&buf))?;
        self.resolution = Some(image.resolution());
        Ok(image)
    }

    /// Reads the headers and body of the next part, up to and including the next boundary.
    fn read_part(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut length = None;
        let mut line = String::new();
        loop {
            line.clear();
            read_line(&mut self.stream, &mut line)?;
            if line.trim().is_empty() {
                break;
            }
            log::trace!("multipart header: {}", line.trim());
            let Some((key, value)) = line.split_once(':') else {
                bail!("malformed multipart header");
            };
            if key.eq_ignore_ascii_case("Content-Type") && value.trim() != "image/jpeg" {
                bail!(
                    "unexpected Content-Type: expected image/jpeg, got {}",
                    value.trim()
                );
            }
            if key.eq_ignore_ascii_case("Content-Length") {
                length = Some(value.trim().parse::<usize>()?);
            }
        }

        let Some(length) = length else {
            bail!("missing Content-Length header");
        };
        if length > MAX_FRAME_BYTES {
            bail!("frame of {length} bytes exceeds the limit of {MAX_FRAME_BYTES} bytes");
        }
        let mut buf = vec![0; length];
        self.stream.read_exact(&mut buf)?;
        self.read_until_boundary()?;
        Ok(buf)
    }

    /// Returns profiling timers for stream access and decoding.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_dequeue, &self.t_decode].into_iter()
    }

    /// Skips everything up to and including the next boundary line.
    ///
    /// The skipped data may be binary, so lines are compared as bytes.
    fn read_until_boundary(&mut self) -> io::Result<()> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.stream.read_until(b'\n', &mut line)? == 0 {
                return Err(eof());
            }
            let line = line.strip_suffix(b"\n").unwrap_or(&line);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line == self.boundary.as_bytes() {
                return Ok(());
            }
        }
    }
}

impl<R: BufRead + Send> CameraSource for HttpStream<R> {
    fn read(&mut self) -> anyhow::Result<Image> {
        HttpStream::read(self)
    }

    /// The resolution is only known after the first frame was decoded, and reported as 0x0 before.
    fn info(&self) -> CameraInfo {
        CameraInfo {
            name: self.name.clone(),
            resolution: self.resolution.unwrap_or(Resolution::new(0, 0)),
            fps: None,
        }
    }
}

/// Like [`BufRead::read_line`], but treats the end of the stream as an error.
fn read_line<R: BufRead>(stream: &mut R, line: &mut String) -> io::Result<()> {
    if stream.read_line(line)? == 0 {
        return Err(eof());
    }
    Ok(())
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "MJPEG stream closed by server")
}

/// Extracts the multipart boundary line from a `Content-Type` header value.
fn parse_content_type(value: &str) -> anyhow::Result<String> {
    let Some((mime, params)) = value.trim().split_once(';') else {
        bail!("malformed Content-Type header");
    };
    if mime.trim() != "multipart/x-mixed-replace" {
        bail!("malformed Content-Type header: unexpected mime type {mime}");
    }
    let Some(bnd) = params.trim().strip_prefix("boundary=") else {
        bail!("malformed Content-Type header (missing boundary)");
    };
    log::trace!("multipart boundary: {bnd}");
    // Some servers (DroidCam) include the `--` in the boundary parameter, which the MIME rules
    // don't allow.
    if bnd.starts_with("--") {
        Ok(bnd.to_string())
    } else {
        Ok(format!("--{bnd}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{codecs::jpeg::JpegEncoder, ColorType};

    use super::*;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![200; (width * height * 3) as usize];
        let mut out = Vec::new();
        JpegEncoder::new(&mut out)
            .encode(&pixels, width, height, ColorType::Rgb8)
            .unwrap();
        out
    }

    fn part(boundary: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn response(param: &str, boundary: &str, bodies: &[&[u8]]) -> Cursor<Vec<u8>> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nServer: test\r\nContent-Type: multipart/x-mixed-replace;boundary={param}\r\n\r\n"
        )
        .into_bytes();
        for body in bodies {
            out.extend(part(boundary, body));
        }
        out.extend_from_slice(format!("{boundary}\r\n").as_bytes());
        Cursor::new(out)
    }

    #[test]
    fn reads_consecutive_frames() {
        let a = jpeg(16, 8);
        let b = jpeg(8, 8);
        let mut stream =
            HttpStream::from_reader(response("--frame", "--frame", &[&a, &b]), "test".into())
                .unwrap();
        assert_eq!(stream.info().resolution, Resolution::new(0, 0));

        let first = stream.read().unwrap();
        assert_eq!(first.resolution(), Resolution::new(16, 8));
        assert_eq!(stream.info().resolution, Resolution::new(16, 8));
        let second = stream.read().unwrap();
        assert_eq!(second.resolution(), Resolution::new(8, 8));

        // The server hung up.
        assert!(stream.read().is_err());
    }

    #[test]
    fn boundary_without_dashes() {
        let a = jpeg(8, 8);
        let mut stream =
            HttpStream::from_reader(response("xyz", "--xyz", &[&a]), "test".into()).unwrap();
        stream.read().unwrap();
    }

    #[test]
    fn corrupt_frame_is_an_error() {
        let good = jpeg(8, 8);
        let mut stream = HttpStream::from_reader(
            response("--b", "--b", &[b"not a jpeg", &good]),
            "test".into(),
        )
        .unwrap();
        assert!(stream.read().is_err());
        // The stream stays in sync and the next frame decodes fine.
        stream.read().unwrap();
    }

    /// Serves `data`, but fails with a timeout once when reaching offset `stall_at`.
    struct Stall {
        data: Cursor<Vec<u8>>,
        stall_at: u64,
        stalled: bool,
    }

    impl Read for Stall {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pos = self.data.position();
            if self.stalled || pos > self.stall_at {
                return self.data.read(buf);
            }
            if pos == self.stall_at {
                self.stalled = true;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "server stalled"));
            }
            let limit = buf.len().min((self.stall_at - pos) as usize);
            self.data.read(&mut buf[..limit])
        }
    }

    #[test]
    fn recovers_from_timeout_mid_frame() {
        let a = jpeg(16, 8);
        let b = jpeg(8, 16);
        let data = response("--b", "--b", &[&a, &b]).into_inner();
        let body_start = data.windows(a.len()).position(|w| w == &a[..]).unwrap();
        let reader = Stall {
            data: Cursor::new(data),
            stall_at: (body_start + a.len() / 2) as u64,
            stalled: false,
        };

        let mut stream = HttpStream::from_reader(BufReader::new(reader), "test".into()).unwrap();
        let err = stream.read().unwrap_err();
        assert_eq!(
            err.downcast_ref::<io::Error>().map(|e| e.kind()),
            Some(io::ErrorKind::TimedOut)
        );
        // The rest of the interrupted frame is skipped.
        assert_eq!(stream.read().unwrap().resolution(), Resolution::new(8, 16));
    }

    #[test]
    fn rejects_oversized_frames() {
        let good = jpeg(8, 8);
        let mut data = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace;boundary=--b\r\n\r\n\
             --b\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            MAX_FRAME_BYTES + 1
        )
        .into_bytes();
        data.extend_from_slice(&[0xff; 64]);
        data.extend_from_slice(b"\r\n");
        data.extend(part("--b", &good));
        data.extend_from_slice(b"--b\r\n");

        let mut stream = HttpStream::from_reader(Cursor::new(data), "test".into()).unwrap();
        let err = stream.read().unwrap_err();
        assert!(err.to_string().contains("exceeds the limit"), "{err}");
        assert_eq!(stream.read().unwrap().resolution(), Resolution::new(8, 8));
    }

    #[test]
    fn rejects_bad_responses() {
        let not_found = Cursor::new(b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec());
        assert!(HttpStream::from_reader(not_found, "test".into()).is_err());

        let no_type = Cursor::new(b"HTTP/1.1 200 OK\r\nServer: test\r\n\r\n".to_vec());
        assert!(HttpStream::from_reader(no_type, "test".into()).is_err());

        let wrong_type =
            Cursor::new(b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n".to_vec());
        assert!(HttpStream::from_reader(wrong_type, "test".into()).is_err());

        let truncated = Cursor::new(b"HTTP/1.1 200 OK\r\n".to_vec());
        assert!(HttpStream::from_reader(truncated, "test".into()).is_err());
    }

    #[test]
    fn addresses() {
        assert_eq!(
            parse_addr("192.168.1.20").unwrap(),
            "192.168.1.20:4747".parse().unwrap()
        );
        assert_eq!(
            parse_addr("10.0.0.1:8080").unwrap(),
            "10.0.0.1:8080".parse().unwrap()
        );
        assert!(parse_addr("phone").is_err());
    }
}
