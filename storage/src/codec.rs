//! Record framing for the encrypted WAL.
//!
//! Each record is stored as `[u32 BE envelope length][envelope]`, where the
//! envelope comes from [`Session::encrypt_record`]. The length covers the
//! sealed bytes, so a reader can step over a record without decrypting it.

use std::borrow::Borrow;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

use crate::crypto::{CryptoError, Session};
use crate::wal::WalError;

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Why replay stopped before the physical end of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncationReason {
    PartialLengthPrefix { bytes: usize },
    ShortPayload { declared: u64, available: u64 },
    /// The last record is complete but does not open.
    Unreadable(String),
}

/// A torn final record: the interrupted tail of an in-progress append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedTail {
    /// LSN the torn record would have had.
    pub lsn: u64,
    /// Byte offset where the torn record starts.
    pub offset: u64,
    pub reason: TruncationReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records: u64,
    pub last_lsn: u64,
    /// Length of the log prefix made of intact records.
    pub valid_len: u64,
    pub truncated: Option<TruncatedTail>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.truncated.is_none()
    }
}

pub struct WalEncoder<W> {
    writer: W,
    session: Session,
    last_lsn: u64,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> WalEncoder<W> {
    pub fn new(writer: W, session: Session) -> Self {
        Self {
            writer,
            session,
            last_lsn: 0,
            bytes_written: 0,
        }
    }

    /// Seal, frame and write one record. Returns its LSN (1-based).
    pub async fn append_record(&mut self, record: &[u8]) -> Result<u64, WalError> {
        let envelope = self.session.encrypt_record(record)?;
        if envelope.len() > MAX_ENVELOPE_LEN {
            return Err(WalError::RecordTooLarge {
                len: envelope.len(),
                limit: MAX_ENVELOPE_LEN,
            });
        }

        // One write per frame keeps prefix and envelope adjacent in the buffer.
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + envelope.len());
        frame.extend_from_slice(&(envelope.len() as u32).to_be_bytes());
        frame.extend_from_slice(&envelope);
        self.writer.write_all(&frame).await?;

        self.last_lsn += 1;
        self.bytes_written += frame.len() as u64;
        debug!(lsn = self.last_lsn, len = envelope.len(), "record appended");
        Ok(self.last_lsn)
    }

    pub async fn flush(&mut self) -> Result<(), WalError> {
        self.writer.flush().await?;
        Ok(())
    }

    pub fn last_lsn(&self) -> u64 {
        self.last_lsn
    }

    pub fn set_last_lsn(&mut self, lsn: u64) {
        self.last_lsn = lsn;
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_parts(self) -> (W, Session) {
        (self.writer, self.session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Reading,
    Ended,
    Failed { offset: u64 },
}

/// Sequential reader over framed records. `S` is the session or a borrow of
/// one, so a WAL can replay with the session its writer owns.
pub struct WalDecoder<R, S = Session> {
    reader: BufReader<R>,
    session: S,
    offset: u64,
    records: u64,
    state: DecoderState,
    truncated: Option<TruncatedTail>,
}

impl<R, S> WalDecoder<R, S>
where
    R: AsyncRead + Unpin,
    S: Borrow<Session>,
{
    pub fn new(reader: R, session: S) -> Self {
        Self {
            reader: BufReader::new(reader),
            session,
            offset: 0,
            records: 0,
            state: DecoderState::Reading,
            truncated: None,
        }
    }

    /// Next record in append order, or `None` at the end of the log.
    ///
    /// A record that is torn or fails to open is tolerated only when nothing
    /// follows it; it then ends the log and is reported by
    /// [`WalDecoder::truncated`]. Anywhere else, including a length prefix
    /// that overruns later intact records, it is `WalError::Corrupted` and
    /// the decoder refuses to read further.
    pub async fn read_next(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        match self.state {
            DecoderState::Reading => {}
            DecoderState::Ended => return Ok(None),
            DecoderState::Failed { offset } => return Err(WalError::Poisoned { offset }),
        }

        let lsn = self.records + 1;
        if self.reader.fill_buf().await?.is_empty() {
            self.state = DecoderState::Ended;
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let got = read_full(&mut self.reader, &mut prefix).await?;
        if got < LENGTH_PREFIX_LEN {
            return Ok(self.end_torn(lsn, TruncationReason::PartialLengthPrefix { bytes: got }));
        }

        let declared = u32::from_be_bytes(prefix) as u64;
        let limit = declared.min(MAX_ENVELOPE_LEN as u64);
        let mut envelope = Vec::with_capacity((limit as usize).min(READ_CHUNK));
        let available = (&mut self.reader)
            .take(limit)
            .read_to_end(&mut envelope)
            .await? as u64;

        if available < declared {
            if available == limit && !self.reader.fill_buf().await?.is_empty() {
                // More than a whole maximum envelope follows: not a torn append.
                return Err(self.fail(
                    lsn,
                    CryptoError::EnvelopeMalformed(format!(
                        "declared length {} exceeds limit {}",
                        declared, MAX_ENVELOPE_LEN
                    )),
                ));
            }
            return self.end_short(lsn, declared, &envelope);
        }

        match Borrow::<Session>::borrow(&self.session).decrypt_record(&envelope) {
            Ok(record) => {
                self.offset += LENGTH_PREFIX_LEN as u64 + declared;
                self.records = lsn;
                Ok(Some(record))
            }
            Err(e) if e.is_integrity_failure() => {
                if self.reader.fill_buf().await?.is_empty() {
                    return Ok(self.end_torn(lsn, TruncationReason::Unreadable(e.to_string())));
                }
                Err(self.fail(lsn, e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The stream ended inside the envelope. That is a torn append unless an
    /// intact record sits in the leftover bytes, which means the length
    /// prefix itself is damaged.
    fn end_short(
        &mut self,
        lsn: u64,
        declared: u64,
        remainder: &[u8],
    ) -> Result<Option<Vec<u8>>, WalError> {
        if let Some(at) = self.intact_frame_in(remainder) {
            return Err(self.fail(
                lsn,
                CryptoError::EnvelopeMalformed(format!(
                    "declared length {} runs past an intact record {} bytes in",
                    declared, at
                )),
            ));
        }
        Ok(self.end_torn(
            lsn,
            TruncationReason::ShortPayload {
                declared,
                available: remainder.len() as u64,
            },
        ))
    }

    /// Offset of the first frame inside `bytes` that opens under this session.
    fn intact_frame_in(&self, bytes: &[u8]) -> Option<usize> {
        let session = Borrow::<Session>::borrow(&self.session);
        let mut start = 0;
        while start + LENGTH_PREFIX_LEN <= bytes.len() {
            let (prefix, body) = bytes[start..].split_at(LENGTH_PREFIX_LEN);
            let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
            if len > 0 && len <= body.len() && session.decrypt_record(&body[..len]).is_ok() {
                return Some(start);
            }
            start += 1;
        }
        None
    }

    fn fail(&mut self, lsn: u64, source: CryptoError) -> WalError {
        error!(lsn, offset = self.offset, "WAL record failed to open mid-stream: {}", source);
        self.state = DecoderState::Failed {
            offset: self.offset,
        };
        WalError::Corrupted {
            lsn,
            offset: self.offset,
            source,
        }
    }

    fn end_torn(&mut self, lsn: u64, reason: TruncationReason) -> Option<Vec<u8>> {
        warn!(lsn, offset = self.offset, ?reason, "WAL ends with a torn record");
        self.truncated = Some(TruncatedTail {
            lsn,
            offset: self.offset,
            reason,
        });
        self.state = DecoderState::Ended;
        None
    }

    /// Bytes of intact records read so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn records_read(&self) -> u64 {
        self.records
    }

    pub fn truncated(&self) -> Option<&TruncatedTail> {
        self.truncated.as_ref()
    }

    pub fn report(&self) -> RecoveryReport {
        RecoveryReport {
            records: self.records,
            last_lsn: self.records,
            valid_len: self.offset,
            truncated: self.truncated.clone(),
        }
    }

    /// Read every remaining record, handing each to `callback` in order.
    pub async fn for_each<F>(&mut self, mut callback: F) -> Result<RecoveryReport, WalError>
    where
        F: FnMut(u64, Vec<u8>) -> Result<(), WalError>,
    {
        while let Some(record) = self.read_next().await? {
            callback(self.records, record)?;
        }
        Ok(self.report())
    }
}

/// Fill `buf` unless the stream ends first; returns the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherAlgorithm, KeyLocator, KeyMaterial, KeySource};
    use std::sync::Arc;
    use std::time::Duration;

    struct StaticKey(Vec<u8>);

    impl KeySource for StaticKey {
        fn name(&self) -> &str {
            "static"
        }

        fn resolve(&self, _locator: &KeyLocator) -> Result<KeyMaterial, CryptoError> {
            Ok(KeyMaterial::new(self.0.clone()))
        }
    }

    async fn session(fill: u8) -> Session {
        Session::open(
            "static",
            Arc::new(StaticKey(vec![fill; 16])),
            KeyLocator::from("static:key"),
            CipherAlgorithm::Aes128Gcm,
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    async fn encode(records: &[&[u8]]) -> Vec<u8> {
        let mut encoder = WalEncoder::new(Vec::new(), session(7).await);
        for record in records {
            encoder.append_record(record).await.unwrap();
        }
        encoder.flush().await.unwrap();
        encoder.into_parts().0
    }

    /// Start offsets of each frame in an encoded log.
    fn frame_offsets(log: &[u8]) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut pos = 0;
        while pos < log.len() {
            offsets.push(pos);
            let len = u32::from_be_bytes(log[pos..pos + 4].try_into().unwrap()) as usize;
            pos += LENGTH_PREFIX_LEN + len;
        }
        offsets
    }

    async fn decode_all(log: &[u8], fill: u8) -> (Vec<Vec<u8>>, Result<RecoveryReport, WalError>) {
        let mut decoder = WalDecoder::new(log, session(fill).await);
        let mut records = Vec::new();
        let result = decoder
            .for_each(|_lsn, record| {
                records.push(record);
                Ok(())
            })
            .await;
        (records, result)
    }

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let log = encode(&[b"a", b"bb", b"", b"ccc"]).await;
        assert_eq!(frame_offsets(&log).len(), 4);

        let (records, report) = decode_all(&log, 7).await;
        let report = report.unwrap();
        assert_eq!(records, vec![b"a".to_vec(), b"bb".to_vec(), Vec::new(), b"ccc".to_vec()]);
        assert!(report.is_clean());
        assert_eq!(report.records, 4);
        assert_eq!(report.valid_len, log.len() as u64);
    }

    #[tokio::test]
    async fn empty_log_reads_nothing() {
        let (records, report) = decode_all(&[], 7).await;
        assert!(records.is_empty());
        assert_eq!(report.unwrap().records, 0);
    }

    #[tokio::test]
    async fn partial_length_prefix_is_a_torn_tail() {
        let mut log = encode(&[b"one", b"two"]).await;
        let intact = log.len() as u64;
        log.extend_from_slice(&[0x00, 0x00]);

        let (records, report) = decode_all(&log, 7).await;
        let report = report.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(report.valid_len, intact);
        assert_eq!(
            report.truncated,
            Some(TruncatedTail {
                lsn: 3,
                offset: intact,
                reason: TruncationReason::PartialLengthPrefix { bytes: 2 },
            })
        );
    }

    #[tokio::test]
    async fn every_cut_inside_the_last_record_recovers_the_rest() {
        let log = encode(&[b"first", b"second", b"third"]).await;
        let last = *frame_offsets(&log).last().unwrap();

        for cut in last + 1..log.len() {
            let (records, report) = decode_all(&log[..cut], 7).await;
            let report = report.unwrap();
            assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()], "cut at {}", cut);
            assert_eq!(report.valid_len, last as u64);
            assert!(report.truncated.is_some());
        }
    }

    #[tokio::test]
    async fn tampered_last_record_is_a_torn_tail() {
        let mut log = encode(&[b"first", b"second"]).await;
        let last_byte = log.len() - 1;
        log[last_byte] ^= 0x01;

        let (records, report) = decode_all(&log, 7).await;
        assert_eq!(records, vec![b"first".to_vec()]);
        assert!(matches!(
            report.unwrap().truncated.unwrap().reason,
            TruncationReason::Unreadable(_)
        ));
    }

    #[tokio::test]
    async fn mid_stream_corruption_is_fatal_after_earlier_records() {
        let mut log = encode(&[b"r1", b"r2", b"r3", b"r4"]).await;
        let offsets = frame_offsets(&log);
        // Flip a ciphertext byte inside r3.
        log[offsets[2] + LENGTH_PREFIX_LEN + 1 + 12] ^= 0x40;

        let mut decoder = WalDecoder::new(log.as_slice(), session(7).await);
        assert_eq!(decoder.read_next().await.unwrap(), Some(b"r1".to_vec()));
        assert_eq!(decoder.read_next().await.unwrap(), Some(b"r2".to_vec()));

        match decoder.read_next().await {
            Err(WalError::Corrupted { lsn, offset, source }) => {
                assert_eq!(lsn, 3);
                assert_eq!(offset, offsets[2] as u64);
                assert!(matches!(source, CryptoError::AuthenticationFailed));
            }
            other => panic!("expected corruption, got {:?}", other.map(|r| r.map(|v| v.len()))),
        }
        assert!(matches!(
            decoder.read_next().await,
            Err(WalError::Poisoned { .. })
        ));
    }

    #[tokio::test]
    async fn damaged_length_prefix_mid_stream_is_fatal() {
        let mut log = encode(&[b"r1", b"r2", b"r3", b"r4"]).await;
        let offsets = frame_offsets(&log);
        // r2 now claims 64 KiB more than it has, running past r3 and r4.
        log[offsets[1] + 1] ^= 0x01;

        let (records, result) = decode_all(&log, 7).await;
        assert_eq!(records, vec![b"r1".to_vec()]);
        match result {
            Err(WalError::Corrupted { lsn, offset, source }) => {
                assert_eq!(lsn, 2);
                assert_eq!(offset, offsets[1] as u64);
                assert!(matches!(source, CryptoError::EnvelopeMalformed(_)));
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn envelope_at_the_size_limit_round_trips() {
        let plain = CipherAlgorithm::Plaintext;
        let overhead = 1 + plain.nonce_size() + plain.tag_size();
        let record = vec![0x5a; MAX_ENVELOPE_LEN - overhead];

        let mut encoder = WalEncoder::new(Vec::new(), Session::plaintext("noop"));
        assert_eq!(encoder.append_record(&record).await.unwrap(), 1);
        let (log, session) = encoder.into_parts();
        assert_eq!(log.len(), LENGTH_PREFIX_LEN + MAX_ENVELOPE_LEN);

        let mut decoder = WalDecoder::new(log.as_slice(), &session);
        assert_eq!(decoder.read_next().await.unwrap(), Some(record));
        assert_eq!(decoder.read_next().await.unwrap(), None);
        assert!(decoder.report().is_clean());
    }

    #[tokio::test]
    async fn envelope_over_the_size_limit_is_rejected() {
        let plain = CipherAlgorithm::Plaintext;
        let overhead = 1 + plain.nonce_size() + plain.tag_size();
        let record = vec![0x5a; MAX_ENVELOPE_LEN - overhead + 1];

        let mut encoder = WalEncoder::new(Vec::new(), Session::plaintext("noop"));
        let err = encoder.append_record(&record).await.unwrap_err();
        assert!(matches!(
            err,
            WalError::RecordTooLarge { len, limit }
                if len == MAX_ENVELOPE_LEN + 1 && limit == MAX_ENVELOPE_LEN
        ));
        assert_eq!(encoder.last_lsn(), 0);
        assert_eq!(encoder.bytes_written(), 0);
        assert!(encoder.into_parts().0.is_empty());
    }

    #[tokio::test]
    async fn wrong_key_fails_on_first_record() {
        let log = encode(&[b"r1", b"r2"]).await;
        let (records, report) = decode_all(&log, 8).await;
        assert!(records.is_empty());
        assert!(matches!(report, Err(WalError::Corrupted { lsn: 1, .. })));
    }

    #[tokio::test]
    async fn oversized_length_at_tail_is_torn() {
        let mut log = encode(&[b"r1"]).await;
        log.extend_from_slice(&(MAX_ENVELOPE_LEN as u32 + 1).to_be_bytes());
        log.extend_from_slice(&[0u8; 16]);

        let (records, report) = decode_all(&log, 7).await;
        assert_eq!(records.len(), 1);
        assert!(matches!(
            report.unwrap().truncated.unwrap().reason,
            TruncationReason::ShortPayload { .. }
        ));
    }

    #[tokio::test]
    async fn plaintext_frames_do_not_hide_payload() {
        let mut encoder = WalEncoder::new(Vec::new(), Session::plaintext("noop"));
        encoder.append_record(b"visible-record").await.unwrap();
        let (log, session) = encoder.into_parts();
        assert!(log.windows(14).any(|w| w == b"visible-record"));

        let mut decoder = WalDecoder::new(log.as_slice(), &session);
        assert_eq!(decoder.read_next().await.unwrap(), Some(b"visible-record".to_vec()));
        assert_eq!(decoder.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_session_cannot_append() {
        let mut encoder = WalEncoder::new(Vec::new(), session(7).await);
        encoder.session_mut().close();
        assert!(matches!(
            encoder.append_record(b"late").await,
            Err(WalError::Crypto(CryptoError::SessionClosed))
        ));
    }
}
