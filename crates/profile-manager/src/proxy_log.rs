use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use system_utils::path::encoded_file_stem;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

pub const MAX_LOG_BYTES: u64 = 2_000_000;
pub const LOG_BACKUPS: usize = 2;

pub type SharedLog = Arc<Mutex<ProxyLog>>;

pub fn log_path(log_dir: &Path, profile: &str) -> PathBuf {
    log_dir.join(format!("wireproxy_{}.log", encoded_file_stem(profile)))
}

/// Append-only log for one profile's wireproxy output, rotated by size into
/// `<file>.1` .. `<file>.N`.
pub struct ProxyLog {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    backups: usize,
}

impl ProxyLog {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_limits(path, MAX_LOG_BYTES, LOG_BACKUPS)
    }

    pub fn with_limits(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            max_bytes,
            backups,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn banner(&mut self, profile: &str, binary: &Path, config: &Path, port: u16) -> io::Result<()> {
        let now = humantime::format_rfc3339_seconds(SystemTime::now());
        self.write_line(&format!(
            "==== {now} starting wireproxy for {profile} on port {port} ===="
        ))?;
        self.write_line(&format!("$ {} -c {}", binary.display(), config.display()))
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.written > 0 && self.written + len > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.written += len;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups == 0 {
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }
        let oldest = self.backup_path(self.backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Copies lines from a child pipe into `log`, tagged with `stream`, until EOF.
pub fn spawn_pump<R>(reader: R, stream: &'static str, log: SharedLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = String::new();
        loop {
            buffer.clear();
            match reader.read_line(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = buffer.trim_end_matches(['\n', '\r']);
                    let Ok(mut log) = log.lock() else {
                        break;
                    };
                    if let Err(err) = log.write_line(&format!("[{stream}] {line}")) {
                        tracing::warn!(path = %log.path().display(), error = %err, "proxy log write failed");
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(stream, error = %err, "proxy output read failed");
                    break;
                }
            }
        }
    })
}
