//! Server side of a file transfer
// (c) 2024 Ross Younger

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt as _,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use tracing::{debug, info, trace, warn};

use super::{Drain, StreamHandler};
use crate::{
    protocol::{ErrorCode, Readable, StreamIo},
    util::mmap::MappedFile,
    Configuration,
};

/// How a server serves files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    /// Requests are resolved below this directory
    pub root: PathBuf,
    /// The most of a file mapped into memory at once
    pub map_window: u64,
    /// The longest acceptable request
    pub max_request_len: usize,
}

impl From<&Configuration> for ServeOptions {
    fn from(config: &Configuration) -> Self {
        Self {
            root: PathBuf::from(&config.root),
            map_window: config.map_window,
            max_request_len: usize::try_from(config.max_request_len).unwrap_or(usize::MAX),
        }
    }
}

impl ServeOptions {
    /// Resolves a request to a path below the root.
    ///
    /// Empty requests, absolute paths and paths which climb out with `..` are refused.
    pub fn resolve(&self, request: &[u8]) -> Result<PathBuf> {
        let requested = Path::new(OsStr::from_bytes(request));
        let mut path = self.root.clone();
        for component in requested.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => (),
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    anyhow::bail!("unsafe path {requested:?}")
                }
            }
        }
        anyhow::ensure!(path != self.root, "empty request");
        Ok(path)
    }
}

/// Serves one file in response to one request.
///
/// The request is accumulated until the client finishes it. The requested file is then
/// mapped and the mapping itself is the send buffer: each time the transport can take more,
/// sending resumes from `bytes_sent`. Any failure to find or map the file produces an
/// empty response.
///
/// The mapping is held until the stream is destroyed.
#[derive(Debug)]
pub struct FileSendStream {
    options: Arc<ServeOptions>,
    request: Vec<u8>,
    mapped: Option<MappedFile>,
    bytes_sent: u64,
}

impl FileSendStream {
    /// Constructor
    #[must_use]
    pub fn new(options: Arc<ServeOptions>) -> Self {
        Self {
            options,
            request: Vec::new(),
            mapped: None,
            bytes_sent: 0,
        }
    }

    /// Number of file bytes the transport has accepted
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn open_requested(&self) -> Result<MappedFile> {
        let path = self.options.resolve(&self.request)?;
        MappedFile::open(&path, self.options.map_window).with_context(|| format!("{path:?}"))
    }

    fn respond_empty(io: &mut StreamIo<'_>) {
        if let Err(e) = io.finish() {
            debug!("{}: finishing empty response: {e}", io.id());
        }
    }

    fn start_response(&mut self, io: &mut StreamIo<'_>) {
        if !io.write_side_open() || self.mapped.is_some() {
            return;
        }
        let request = String::from_utf8_lossy(&self.request).into_owned();
        match self.open_requested() {
            Ok(mapped) if mapped.len() > 0 => {
                info!("{}: sending {request} ({} bytes)", io.id(), mapped.len());
                self.mapped = Some(mapped);
                self.send_next_block(io);
            }
            Ok(_) => {
                debug!("{}: {request} is empty", io.id());
                Self::respond_empty(io);
            }
            Err(e) => {
                info!("{}: cannot serve {request}: {e:#}", io.id());
                Self::respond_empty(io);
            }
        }
    }

    fn send_next_block(&mut self, io: &mut StreamIo<'_>) {
        let Some(mapped) = self.mapped.as_mut() else {
            return;
        };
        let length = mapped.len();
        while self.bytes_sent < length && io.write_side_open() {
            let slice = match mapped.slice_from(self.bytes_sent) {
                Ok(s) => s,
                Err(e) => {
                    warn!("{}: remapping at {}: {e}", io.id(), self.bytes_sent);
                    io.close_write_side(ErrorCode::Abandoned);
                    return;
                }
            };
            let fin = self.bytes_sent + slice.len() as u64 == length;
            match io.write(slice, fin) {
                Ok(0) => return,
                Ok(n) => {
                    self.bytes_sent += n as u64;
                    trace!("{}: {} of {length} bytes sent", io.id(), self.bytes_sent);
                }
                Err(e) => {
                    debug!("{}: sending stopped: {e}", io.id());
                    return;
                }
            }
        }
    }
}

impl StreamHandler for FileSendStream {
    fn on_readable(&mut self, io: &mut StreamIo<'_>) -> Drain {
        // The request is already complete; the response must not be disturbed.
        if !io.read_side_open() {
            return Drain::Drained;
        }
        loop {
            let room = self.options.max_request_len.saturating_sub(self.request.len());
            match io.read(room + 1) {
                Ok(Readable::Data { bytes, .. }) => {
                    if bytes.len() > room {
                        warn!(
                            "{}: request exceeds {} bytes",
                            io.id(),
                            self.options.max_request_len
                        );
                        io.stop_reading(ErrorCode::Rejected);
                        Self::respond_empty(io);
                        return Drain::Drained;
                    }
                    self.request.extend_from_slice(&bytes);
                }
                Ok(Readable::Blocked) => return Drain::Drained,
                Ok(Readable::Finished) => {
                    self.start_response(io);
                    return Drain::Drained;
                }
                Err(e) => {
                    debug!("{}: request abandoned: {e}", io.id());
                    io.close_write_side(ErrorCode::Abandoned);
                    return Drain::Drained;
                }
            }
        }
    }

    fn on_writable(&mut self, io: &mut StreamIo<'_>) {
        self.send_next_block(io);
    }

    fn on_close(&mut self) {
        trace!("stream closed after {} bytes", self.bytes_sent);
    }
}

#[cfg(test)]
mod test {
    use super::{FileSendStream, ServeOptions};
    use crate::protocol::{ErrorCode, StreamCore, StreamIo};
    use crate::session::{test::MockTransport, StreamHandler as _};

    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::{path::Path, sync::Arc};
    use tempfile::TempDir;

    fn options(root: &Path, window: u64) -> Arc<ServeOptions> {
        Arc::new(ServeOptions {
            root: root.to_path_buf(),
            map_window: window,
            max_request_len: 64,
        })
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
    }

    #[rstest]
    #[case("a.txt", Some("/srv/a.txt"))]
    #[case("./sub/b", Some("/srv/sub/b"))]
    #[case("sub/../b", None)]
    #[case("/etc/passwd", None)]
    #[case("", None)]
    #[case(".", None)]
    fn resolution(#[case] request: &str, #[case] expected: Option<&str>) {
        let opts = ServeOptions {
            root: "/srv".into(),
            map_window: 4096,
            max_request_len: 64,
        };
        let result = opts.resolve(request.as_bytes()).ok();
        assert_eq!(result.as_deref(), expected.map(Path::new));
    }

    #[test]
    fn serves_whole_file() {
        let dir = TempDir::new().unwrap();
        let content = pattern(10_000);
        std::fs::write(dir.path().join("f"), &content).unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(dir.path(), 4096));

        transport.push_inbound(id, b"f");
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        // nothing sent until the request is finished
        assert!(transport.written(id).is_empty());
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.written(id), content.as_slice());
        assert!(transport.is_finished(id));
        assert_eq!(s.bytes_sent(), 10_000);
    }

    #[test]
    fn wakeup_after_request_fin_keeps_sending() {
        let dir = TempDir::new().unwrap();
        let content = pattern(10_000);
        std::fs::write(dir.path().join("f"), &content).unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(dir.path(), 4096));
        transport.set_write_credit(id, Some(1000));
        transport.push_inbound(id, b"f");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(s.bytes_sent(), 1000);

        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.reset_code(id), None);
        transport.set_write_credit(id, None);
        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.written(id), content.as_slice());
        assert!(transport.is_finished(id));
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(4096)]
    #[case(5000)]
    fn backpressure(#[case] credit: usize) {
        let dir = TempDir::new().unwrap();
        let content = pattern(20_000);
        std::fs::write(dir.path().join("f"), &content).unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        // small window, so the mapping slides as well
        let mut s = FileSendStream::new(options(dir.path(), 4096));

        transport.set_write_credit(id, Some(credit));
        transport.push_inbound(id, b"f");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        let mut wakeups = 0;
        while !transport.is_finished(id) {
            assert_eq!(s.bytes_sent(), transport.written(id).len() as u64);
            transport.set_write_credit(id, Some(credit));
            s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
            wakeups += 1;
            assert!(wakeups <= 20_000);
        }
        assert_eq!(transport.written(id), content.as_slice());
    }

    #[test]
    fn missing_file_gives_empty_response() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(dir.path(), 4096));
        transport.push_inbound(id, b"nope");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert!(transport.written(id).is_empty());
        assert!(transport.is_finished(id));
        assert_eq!(transport.reset_code(id), None);
    }

    #[test]
    fn empty_file_gives_empty_response() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(dir.path(), 4096));
        transport.push_inbound(id, b"empty");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert!(transport.is_finished(id));
    }

    #[test]
    fn traversal_gives_empty_response() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("root")).unwrap();
        std::fs::write(dir.path().join("secret"), b"xyzzy").unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(&dir.path().join("root"), 4096));
        transport.push_inbound(id, b"../secret");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert!(transport.written(id).is_empty());
        assert!(transport.is_finished(id));
    }

    #[test]
    fn oversized_request() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(dir.path(), 4096));
        transport.push_inbound(id, &[b'a'; 40]);
        transport.push_inbound(id, &[b'b'; 40]);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.stop_code(id), Some(ErrorCode::Rejected));
        assert!(transport.is_finished(id));
    }

    #[test]
    fn peer_stop_halts_sending() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), pattern(1000)).unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(dir.path(), 4096));
        transport.set_write_credit(id, Some(100));
        transport.push_inbound(id, b"f");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(s.bytes_sent(), 100);
        transport.set_peer_stopped(id, 0);
        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(s.bytes_sent(), 100);
        assert!(core.is_fully_closed());
    }

    #[test]
    fn request_reset() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.incoming_stream();
        let mut core = StreamCore::new(id);
        let mut s = FileSendStream::new(options(dir.path(), 4096));
        transport.push_inbound(id, b"f");
        transport.push_reset(id, 1);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.reset_code(id), Some(ErrorCode::Abandoned));
        assert!(core.is_fully_closed());
    }
}
