//! Line-oriented readers and writers over named byte streams.
use std::{
    ffi::CString,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read},
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, OpenOptionsExt},
    },
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::unix::pipe,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::{ExecError, ExecResult},
    process::Liveness,
};

/// Background reader feeding every non-empty line of a stream to a callback.
///
/// The reader keeps going while the owning process is expected to run,
/// or unconditionally while the persistence flag is set.
pub struct PipeChannel {
    name: String,
    cancel: CancellationToken,
    persist: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PipeChannel {
    pub fn read<R, F>(
        reader: R,
        name: impl Into<String>,
        poll: Duration,
        liveness: Liveness,
        persist: bool,
        mut callback: F,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        F: FnMut(&str) + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let persist = Arc::new(AtomicBool::new(persist));

        let token = cancel.clone();
        let keep = Arc::clone(&persist);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            debug!(target: "qkd.exec.pipe", name = %task_name, "reader started");
            while keep.load(Ordering::Acquire) || liveness.is_alive() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = timeout(poll, lines.next_line()) => match res {
                        Err(_) => {}
                        Ok(Ok(Some(line))) => {
                            let line = clean_line(&line);
                            if !line.is_empty() {
                                callback(line);
                            }
                        }
                        Ok(Ok(None)) => sleep(poll).await,
                        Ok(Err(e)) => {
                            trace!(target: "qkd.exec.pipe", name = %task_name, error = %e, "read failed; retrying");
                            sleep(poll).await;
                        }
                    },
                }
            }
            debug!(target: "qkd.exec.pipe", name = %task_name, "reader stopped");
        });

        Self {
            name,
            cancel,
            persist,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clearing the flag lets the reader finish at the next poll once its producer is gone.
    pub fn set_persist(&self, persist: bool) {
        self.persist.store(persist, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Strips zero padding some producers emit before a record, plus the line terminator.
fn clean_line(line: &str) -> &str {
    line.trim_start_matches('\0').trim_end_matches(['\r', '\n'])
}

/// Newline-terminated writer over any async sink.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send_line(&mut self, line: &str) -> ExecResult<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.trim_end_matches('\n').as_bytes());
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Create a FIFO at `path`, replacing any non-FIFO file of the same name.
pub fn make_fifo(path: &Path) -> ExecResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ExecError::Io(format!("nul byte in path {}", path.display())))?;
    // SAFETY: c_path is a valid nul-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Open a FIFO for async reading without waiting for a writer.
pub fn open_fifo_reader(path: &Path) -> ExecResult<pipe::Receiver> {
    let mut opts = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    opts.read_write(true);
    Ok(opts.open_receiver(path)?)
}

/// Open a FIFO for async writing without waiting for a reader.
pub fn open_fifo_writer(path: &Path) -> ExecResult<pipe::Sender> {
    let mut opts = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    opts.read_write(true);
    Ok(opts.open_sender(path)?)
}

/// Open a FIFO read-write so it can be handed to a child as a standard stream.
pub fn open_fifo_for_stdio(path: &Path) -> ExecResult<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Discard whatever is buffered in a FIFO. Returns the number of bytes dropped.
pub fn drain_fifo(path: &Path) -> ExecResult<usize> {
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        path::PathBuf,
        sync::Mutex,
        time::{SystemTime, UNIX_EPOCH},
    };
    use tokio::io::duplex;

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |l: &str| sink.lock().unwrap().push(l.to_string()))
    }

    fn temp_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("qkd-exec-{tag}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn clean_line_strips_padding_and_terminators() {
        assert_eq!(clean_line("\0\0\0connected\r"), "connected");
        assert_eq!(clean_line("a b"), "a b");
        assert_eq!(clean_line("\0\0"), "");
    }

    #[tokio::test]
    async fn reader_delivers_lines_and_skips_empty_ones() {
        let (mut tx, rx) = duplex(256);
        let (seen, cb) = collector();
        let mut ch = PipeChannel::read(rx, "test", Duration::from_millis(20), Liveness::new(true), false, cb);

        tx.write_all(b"first\n\n\0\0second\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ch.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
        assert!(ch.is_finished());
    }

    #[tokio::test]
    async fn reader_ends_when_owner_stops_and_not_persistent() {
        let (_tx, rx) = duplex(64);
        let alive = Liveness::new(true);
        let (_seen, cb) = collector();
        let ch = PipeChannel::read(rx, "test", Duration::from_millis(20), alive.clone(), false, cb);

        alive.set(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ch.is_finished());
    }

    #[tokio::test]
    async fn persistent_reader_outlives_owner_until_flag_cleared() {
        let (mut tx, rx) = duplex(64);
        let (seen, cb) = collector();
        let ch = PipeChannel::read(rx, "test", Duration::from_millis(20), Liveness::new(false), true, cb);

        tx.write_all(b"late\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ch.is_finished());
        assert_eq!(*seen.lock().unwrap(), vec!["late".to_string()]);

        ch.set_persist(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ch.is_finished());
    }

    #[tokio::test]
    async fn fifo_roundtrip_and_drain() {
        let path = temp_path("fifo");
        make_fifo(&path).unwrap();
        // Idempotent on an existing FIFO.
        make_fifo(&path).unwrap();

        let rx = open_fifo_reader(&path).unwrap();
        let (seen, cb) = collector();
        let mut ch = PipeChannel::read(rx, "fifo", Duration::from_millis(20), Liveness::new(true), false, cb);

        let mut w = LineWriter::new(open_fifo_writer(&path).unwrap());
        w.send_line("ne1:1000").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ch.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec!["ne1:1000".to_string()]);

        w.send_line("stale").await.unwrap();
        assert_eq!(drain_fifo(&path).unwrap(), "stale\n".len());
        drop(w);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn make_fifo_replaces_regular_file() {
        let path = temp_path("regular");
        fs::write(&path, b"x").unwrap();
        make_fifo(&path).unwrap();
        assert!(fs::metadata(&path).unwrap().file_type().is_fifo());
        let _ = fs::remove_file(&path);
    }
}
