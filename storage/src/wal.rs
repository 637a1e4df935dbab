use crate::codec::{RecoveryReport, TruncationReason, WalDecoder, WalEncoder};
use crate::crypto::{CryptoError, CryptoService, Session};
use cryptwal_core::config::StorageConfig;
use cryptwal_core::error::{CryptwalError, ErrorCode};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::BufWriter;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("At-rest encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("WAL corrupted at record {lsn} (offset {offset}): {source}")]
    Corrupted {
        lsn: u64,
        offset: u64,
        #[source]
        source: CryptoError,
    },
    #[error("WAL stream already failed at offset {offset}")]
    Poisoned { offset: u64 },
    #[error("Record envelope is {len} bytes, limit is {limit}")]
    RecordTooLarge { len: usize, limit: usize },
    #[error("WAL ends with record {lsn} (offset {offset}) that does not open; refusing to append")]
    UnreadableTail { lsn: u64, offset: u64 },
}

impl CryptwalError for WalError {
    fn error_code(&self) -> ErrorCode {
        match self {
            WalError::Io(_) => ErrorCode::Internal,
            WalError::Crypto(e) => e.error_code(),
            WalError::Corrupted { .. } => ErrorCode::DataLoss,
            WalError::Poisoned { .. } => ErrorCode::DataLoss,
            WalError::RecordTooLarge { .. } => ErrorCode::InvalidArgument,
            WalError::UnreadableTail { .. } => ErrorCode::DataLoss,
        }
    }
}

pub struct Wal {
    path: PathBuf,
    encoder: WalEncoder<BufWriter<File>>,
    /// Set by replay when the last record is whole but does not open.
    unreadable_tail: Option<(u64, u64)>,
}

impl Wal {
    /// Open a WAL file without encryption. If it doesn't exist, it will be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        Self::open_with_session(path, Session::plaintext("noop")).await
    }

    /// Open a WAL file with a fresh session from `service`.
    pub async fn open_with_service(
        path: impl AsRef<Path>,
        service: &CryptoService,
    ) -> Result<Self, WalError> {
        let session = service.open_session().await?;
        Self::open_with_session(path, session).await
    }

    /// Open the log `name` under the configured WAL directory.
    pub async fn open_in(
        storage: &StorageConfig,
        name: &str,
        service: &CryptoService,
    ) -> Result<Self, WalError> {
        Self::open_with_service(storage.wal_path(name), service).await
    }

    /// Open a WAL file whose records are sealed by `session`.
    ///
    /// An existing log must be [`Wal::replay`]ed before appending so a torn
    /// tail is cut off and LSNs continue where they left off.
    pub async fn open_with_session(
        path: impl AsRef<Path>,
        session: Session,
    ) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            encoder: WalEncoder::new(BufWriter::new(file), session),
            unreadable_tail: None,
        })
    }

    /// Append an entry to the WAL. Returns the assigned LSN.
    /// Format: [Len: 4 bytes BE][Envelope: Len bytes]
    pub async fn append(&mut self, payload: &[u8]) -> Result<u64, WalError> {
        if let Some((lsn, offset)) = self.unreadable_tail {
            return Err(WalError::UnreadableTail { lsn, offset });
        }
        // Note: We don't flush here by default for batch performance,
        // explicit flush() or periodic flush is expected.
        self.encoder.append_record(payload).await
    }

    /// Flush the internal buffer to disk, ensuring durability.
    pub async fn flush(&mut self) -> Result<(), WalError> {
        self.encoder.flush().await?;
        self.encoder.writer_mut().get_ref().sync_all().await?; // fsync
        Ok(())
    }

    pub fn current_lsn(&self) -> u64 {
        self.encoder.last_lsn()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> &Session {
        self.encoder.session()
    }

    /// Replays the WAL from the beginning, in append order.
    ///
    /// A final record cut short by a crash is removed from the file and
    /// noted in the report. A final record that is complete but does not
    /// open (wrong key, wrong provider, bit rot) is reported and left on
    /// disk, and appends are refused until a replay comes back clean. A bad
    /// record anywhere else stops replay with `WalError::Corrupted` after
    /// the records before it were delivered.
    pub async fn replay<F>(&mut self, callback: F) -> Result<RecoveryReport, WalError>
    where
        F: FnMut(u64, Vec<u8>) -> Result<(), WalError>,
    {
        // Ensure everything is written before reading
        self.encoder.flush().await?;

        let file = File::open(&self.path).await?;
        let report = {
            let mut decoder = WalDecoder::new(file, self.encoder.session());
            decoder.for_each(callback).await?
        };

        self.unreadable_tail = None;
        match &report.truncated {
            Some(tail) if matches!(tail.reason, TruncationReason::Unreadable(_)) => {
                warn!(
                    lsn = tail.lsn,
                    offset = tail.offset,
                    "final WAL record does not open; leaving it in place"
                );
                self.unreadable_tail = Some((tail.lsn, tail.offset));
            }
            Some(_) => {
                // Truncate partial writes at the end
                let file = self.encoder.writer_mut().get_mut();
                if report.valid_len < file.metadata().await?.len() {
                    file.set_len(report.valid_len).await?;
                    file.sync_all().await?;
                }
            }
            None => {}
        }

        self.encoder.set_last_lsn(report.last_lsn);
        info!(
            records = report.records,
            last_lsn = report.last_lsn,
            truncated = report.truncated.is_some(),
            provider = %self.encoder.session().provider(),
            "WAL recovery complete"
        );

        Ok(report)
    }

    /// Flush, fsync and close the session, zeroizing its key.
    pub async fn close(mut self) -> Result<(), WalError> {
        let flushed = self.flush().await;
        self.encoder.session_mut().close();
        flushed
    }
}
