//! Client side of a file transfer
// (c) 2024 Ross Younger

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt as _,
    path::{Path, PathBuf},
};

use indicatif::ProgressBar;
use tracing::{debug, error, trace, warn};

use super::{Drain, StreamHandler};
use crate::protocol::{ErrorCode, Readable, StreamError, StreamIo};

/// The largest region pulled from the transport at once
const MAX_REGION: usize = 1024 * 1024;

/// Called once, when a [`FileReceiveStream`] is destroyed
pub type CloseObserver = Box<dyn FnOnce(&FileReceiveStream)>;

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The whole response was received and stored
    Complete,
    /// The response could not be received or stored
    Failed(String),
    /// The stream closed before the response was complete
    Aborted,
    /// The server refused the request, typically because it is going away.
    /// The request may be retried on a new connection.
    Rejected,
}

/// Summary of a finished transfer, as handed to a [`CloseObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// The file name as requested
    pub name: String,
    /// Where the response was written
    pub path: PathBuf,
    /// Number of bytes stored
    pub bytes: u64,
    /// What happened
    pub outcome: TransferOutcome,
}

/// Requests a file and writes the response to disk as it arrives.
///
/// The output file is `_<name>` in the output directory, so fetching into the directory
/// being served does not clobber the original. It is opened before the request is sent but
/// only truncated once the transport has accepted the stream, and written with positioned writes.
pub struct FileReceiveStream {
    name: String,
    path: PathBuf,
    output: Option<File>,
    truncated: bool,
    request: Vec<u8>,
    request_sent: usize,
    finish_request: bool,
    read_budget: usize,
    bytes_received: u64,
    complete: bool,
    rejected: bool,
    failure: Option<String>,
    progress: ProgressBar,
    observer: Option<CloseObserver>,
}

impl std::fmt::Debug for FileReceiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReceiveStream")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("request_sent", &self.request_sent)
            .field("bytes_received", &self.bytes_received)
            .field("complete", &self.complete)
            .field("failure", &self.failure)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

/// Computes the local output path for a requested name
pub(crate) fn output_path(output_dir: &Path, name: &str) -> io::Result<PathBuf> {
    let Some(base) = Path::new(name).file_name() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot derive an output file name from {name:?}"),
        ));
    };
    let mut local = std::ffi::OsString::from("_");
    local.push(base);
    Ok(output_dir.join(local))
}

impl FileReceiveStream {
    /// Opens the output file for a request.
    ///
    /// `finish_request` controls whether the request is finished (FIN) once sent.
    /// `read_budget` is the number of regions pulled per readable wakeup.
    pub fn open(
        output_dir: &Path,
        name: &str,
        finish_request: bool,
        read_budget: u32,
        progress: ProgressBar,
    ) -> io::Result<Self> {
        let path = output_path(output_dir, name)?;
        let output = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        trace!("opened {path:?} for {name}");
        Ok(Self {
            name: name.to_string(),
            path,
            output: Some(output),
            truncated: false,
            request: name.as_bytes().to_vec(),
            request_sent: 0,
            finish_request,
            read_budget: usize::try_from(read_budget.max(1)).unwrap_or(usize::MAX),
            bytes_received: 0,
            complete: false,
            rejected: false,
            failure: None,
            progress,
            observer: None,
        })
    }

    /// Registers the observer to be told when the stream closes
    pub fn set_observer(&mut self, observer: CloseObserver) {
        self.observer = Some(observer);
    }

    /// The file name as requested
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of bytes stored so far
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Summarises the transfer
    #[must_use]
    pub fn report(&self) -> TransferReport {
        let outcome = if let Some(msg) = &self.failure {
            TransferOutcome::Failed(msg.clone())
        } else if self.complete {
            TransferOutcome::Complete
        } else if self.rejected {
            TransferOutcome::Rejected
        } else {
            TransferOutcome::Aborted
        };
        TransferReport {
            name: self.name.clone(),
            path: self.path.clone(),
            bytes: self.bytes_received,
            outcome,
        }
    }

    /// Discards any previous download, once only.
    fn truncate_output(&mut self) -> io::Result<()> {
        if !self.truncated {
            if let Some(file) = self.output.as_ref() {
                file.set_len(0)?;
            }
            self.truncated = true;
        }
        Ok(())
    }

    fn send_request(&mut self, io: &mut StreamIo<'_>) {
        if !io.write_side_open() {
            return;
        }
        if let Err(e) = self.truncate_output() {
            error!("{}: truncating {:?}: {e}", io.id(), self.path);
            self.failure = Some(format!("truncating {}: {e}", self.path.display()));
            io.close_write_side(ErrorCode::Failed);
            io.stop_reading(ErrorCode::Failed);
            return;
        }
        let remaining = &self.request[self.request_sent..];
        if remaining.is_empty() && !self.finish_request {
            return;
        }
        match io.write(remaining, self.finish_request) {
            Ok(n) => {
                self.request_sent += n;
                trace!(
                    "{}: sent {} of {} request bytes",
                    io.id(),
                    self.request_sent,
                    self.request.len()
                );
            }
            Err(e) => warn!("{}: request for {} not sent: {e}", io.id(), self.name),
        }
    }

    /// A response has started while we were still sending; the request is moot.
    fn abandon_request(&mut self, io: &mut StreamIo<'_>) {
        if io.write_side_open() {
            debug!("{}: response arrived before request was finished", io.id());
            io.close_write_side(ErrorCode::Abandoned);
        }
    }

    fn store(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let Some(file) = self.output.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "output file already closed",
            ));
        };
        if !self.truncated {
            file.set_len(0)?;
            self.truncated = true;
        }
        file.write_all_at(data, offset)?;
        let len = data.len() as u64;
        self.bytes_received += len;
        self.progress.inc(len);
        Ok(())
    }

    fn fail(&mut self, io: &mut StreamIo<'_>, message: String) {
        io.stop_reading(ErrorCode::Failed);
        self.failure = Some(message);
    }
}

impl StreamHandler for FileReceiveStream {
    fn on_readable(&mut self, io: &mut StreamIo<'_>) -> Drain {
        // A late wakeup must not disturb a finished outcome.
        if !io.read_side_open() {
            return Drain::Drained;
        }
        for _ in 0..self.read_budget {
            match io.read(MAX_REGION) {
                Ok(Readable::Data { offset, bytes }) => {
                    self.abandon_request(io);
                    if let Err(e) = self.store(offset, &bytes) {
                        error!("{}: writing {:?}: {e}", io.id(), self.path);
                        self.fail(io, format!("writing {}: {e}", self.path.display()));
                        return Drain::Drained;
                    }
                }
                Ok(Readable::Blocked) => return Drain::Drained,
                Ok(Readable::Finished) => {
                    self.abandon_request(io);
                    debug!(
                        "{}: {} complete, {} bytes",
                        io.id(),
                        self.name,
                        self.bytes_received
                    );
                    self.complete = true;
                    return Drain::Drained;
                }
                Err(StreamError::Reset(code))
                    if code == ErrorCode::Rejected as u64 && self.bytes_received == 0 =>
                {
                    debug!("{}: server rejected request for {}", io.id(), self.name);
                    self.rejected = true;
                    return Drain::Drained;
                }
                Err(e) => {
                    warn!("{}: receiving {}: {e}", io.id(), self.name);
                    self.failure = Some(e.to_string());
                    return Drain::Drained;
                }
            }
        }
        Drain::Paused
    }

    fn on_writable(&mut self, io: &mut StreamIo<'_>) {
        self.send_request(io);
    }

    fn on_close(&mut self) {
        drop(self.output.take());
        if let Some(observer) = self.observer.take() {
            observer(self);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{output_path, FileReceiveStream, TransferOutcome};
    use crate::protocol::{ErrorCode, StreamCore, StreamIo};
    use crate::session::{test::MockTransport, Drain, StreamHandler as _};

    use indicatif::ProgressBar;
    use pretty_assertions::assert_eq;
    use std::{cell::RefCell, path::Path, rc::Rc};
    use tempfile::TempDir;

    fn stream(dir: &Path, name: &str, finish: bool) -> FileReceiveStream {
        FileReceiveStream::open(dir, name, finish, 64, ProgressBar::hidden()).unwrap()
    }

    #[test]
    fn output_names() {
        let dir = Path::new("/out");
        assert_eq!(output_path(dir, "a.txt").unwrap(), Path::new("/out/_a.txt"));
        assert_eq!(
            output_path(dir, "sub/dir/b.bin").unwrap(),
            Path::new("/out/_b.bin")
        );
        assert!(output_path(dir, "..").is_err());
        assert!(output_path(dir, "").is_err());
    }

    #[test]
    fn request_then_response() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        let mut s = stream(dir.path(), "file.txt", true);

        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.written(id), b"file.txt");
        assert!(transport.is_finished(id));

        transport.push_inbound(id, b"hello ");
        transport.push_inbound(id, b"world");
        transport.push_fin(id);
        let drain = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(drain, Drain::Drained);
        let report = s.report();
        assert_eq!(report.outcome, TransferOutcome::Complete);
        assert_eq!(report.bytes, 11);
        s.on_close();
        let content = std::fs::read(dir.path().join("_file.txt")).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[test]
    fn wakeup_after_fin_keeps_outcome() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        let mut s = stream(dir.path(), "again", true);
        transport.push_inbound(id, b"data");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(s.report().outcome, TransferOutcome::Complete);

        let drain = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(drain, Drain::Drained);
        let report = s.report();
        assert_eq!(report.outcome, TransferOutcome::Complete);
        assert_eq!(report.bytes, 4);
    }

    #[test]
    fn refetch_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("_f");
        std::fs::write(&path, b"a much longer previous download").unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        let mut s = stream(dir.path(), "f", true);
        transport.push_inbound(id, b"new");
        transport.push_fin(id);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        s.on_close();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn unsent_request_keeps_previous_download() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("_kept");
        std::fs::write(&path, b"earlier").unwrap();
        // as when the transport refuses the stream
        let s = stream(dir.path(), "kept", true);
        drop(s);
        assert_eq!(std::fs::read(&path).unwrap(), b"earlier");
    }

    #[test]
    fn sending_request_discards_previous_download() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("_gone");
        std::fs::write(&path, b"earlier").unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        let mut s = stream(dir.path(), "gone", true);
        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn partial_request_resumes() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        transport.set_write_credit(id, Some(4));
        let mut core = StreamCore::new(id);
        let mut s = stream(dir.path(), "abcdefgh", true);
        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.written(id), b"abcd");
        assert!(!transport.is_finished(id));
        transport.set_write_credit(id, None);
        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.written(id), b"abcdefgh");
        assert!(transport.is_finished(id));
    }

    #[test]
    fn premature_response_abandons_request() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        // request sent but not finished
        let mut s = stream(dir.path(), "early", false);
        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.written(id), b"early");

        transport.push_inbound(id, b"xyz");
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.reset_code(id), Some(ErrorCode::Abandoned));
        let io = StreamIo::new(&mut transport, &mut core);
        assert!(!io.write_side_open());

        // nothing further is sent
        s.on_writable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(transport.written(id), b"early");
        assert_eq!(s.bytes_received(), 3);
    }

    #[test]
    fn read_budget_pauses() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        let mut s =
            FileReceiveStream::open(dir.path(), "b", true, 2, ProgressBar::hidden()).unwrap();
        for chunk in [b"12", b"34", b"56"] {
            transport.push_inbound(id, chunk);
        }
        transport.push_fin(id);
        let first = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(first, Drain::Paused);
        assert_eq!(s.bytes_received(), 4);
        let second = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(second, Drain::Drained);
        assert_eq!(s.report().outcome, TransferOutcome::Complete);
    }

    #[test]
    fn peer_reset_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        let mut s = stream(dir.path(), "r", true);
        transport.push_inbound(id, b"part");
        transport.push_reset(id, 7);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert!(matches!(s.report().outcome, TransferOutcome::Failed(_)));
    }

    #[test]
    fn rejection_is_retryable() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockTransport::default();
        let id = transport.open_stream();
        let mut core = StreamCore::new(id);
        let mut s = stream(dir.path(), "late", true);
        transport.push_reset(id, ErrorCode::Rejected as u64);
        let _ = s.on_readable(&mut StreamIo::new(&mut transport, &mut core));
        assert_eq!(s.report().outcome, TransferOutcome::Rejected);
    }

    #[test]
    fn observer_called_once_on_close() {
        let dir = TempDir::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut s = stream(dir.path(), "o", true);
        let sink = seen.clone();
        s.set_observer(Box::new(move |stream| sink.borrow_mut().push(stream.report())));
        s.on_close();
        s.on_close();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].outcome, TransferOutcome::Aborted);
    }

    #[test]
    fn unopenable_output() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no/such/dir");
        assert!(
            FileReceiveStream::open(&missing, "x", true, 1, ProgressBar::hidden()).is_err()
        );
    }
}
