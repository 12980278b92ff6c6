use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use assetlink_protocol::{AssetChunk, AssetHeader, SequencedChunk};
use tracing::{debug, warn};

use crate::TransferError;

/// Byte source a producer can read from and rewind.
pub trait AssetSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> AssetSource for T {}

/// Producer over a type-erased source, so producers for files and in-memory
/// assets can share one queue.
pub type BoxedProducer = AssetProducer<Box<dyn AssetSource>>;

/// Slices one asset into an ordered run of chunks of at most `chunk_size`
/// bytes.
///
/// Pull-based: every [`produce`](Self::produce) call reads the next slice.
/// A chunk is either produced whole or not at all; a failed read leaves the
/// position where it was.
pub struct AssetProducer<R> {
    header: AssetHeader,
    source: R,
    chunk_size: usize,
    bytes_produced: u64,
    next_index: u64,
}

impl<R: Read + Seek> AssetProducer<R> {
    /// Creates a producer reading `header.size` bytes from the start of
    /// `source`.
    pub fn new(
        header: AssetHeader,
        mut source: R,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidArgument(
                "chunk size must be greater than zero".into(),
            ));
        }
        source
            .seek(SeekFrom::Start(0))
            .map_err(|source| TransferError::SourceRead {
                key: header.id,
                source,
            })?;
        Ok(Self {
            header,
            source,
            chunk_size,
            bytes_produced: 0,
            next_index: 0,
        })
    }

    /// Returns the next chunk, or `None` once all `header.size` bytes have
    /// been produced. Calling again after that keeps returning `None`.
    pub fn produce(&mut self) -> Result<Option<AssetChunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let len = remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; len];
        if let Err(source) = self.source.read_exact(&mut buf) {
            self.restore_position();
            return Err(TransferError::SourceRead {
                key: self.header.id,
                source,
            });
        }

        self.bytes_produced += len as u64;
        self.next_index += 1;
        if self.is_exhausted() {
            debug!(key = %self.header.id, chunks = self.next_index, "asset fully produced");
        }
        Ok(Some(AssetChunk::new(self.header.id, buf)))
    }

    /// Like [`produce`](Self::produce), but tags the chunk with its index and
    /// byte offset.
    pub fn produce_sequenced(&mut self) -> Result<Option<SequencedChunk>, TransferError> {
        let index = self.next_index;
        let offset = self.bytes_produced;
        Ok(self.produce()?.map(|chunk| SequencedChunk {
            id: chunk.id,
            index,
            offset,
            data: chunk.data,
        }))
    }

    /// Rewinds to the first chunk.
    pub fn reset(&mut self) -> Result<(), TransferError> {
        self.source
            .seek(SeekFrom::Start(0))
            .map_err(|source| TransferError::SourceRead {
                key: self.header.id,
                source,
            })?;
        self.bytes_produced = 0;
        self.next_index = 0;
        Ok(())
    }

    // `read_exact` may have consumed part of the slice before failing.
    fn restore_position(&mut self) {
        if let Err(e) = self.source.seek(SeekFrom::Start(self.bytes_produced)) {
            warn!(key = %self.header.id, error = %e, "could not restore source position");
        }
    }
}

impl<R> AssetProducer<R> {
    pub fn header(&self) -> &AssetHeader {
        &self.header
    }

    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }

    pub fn remaining(&self) -> u64 {
        self.header.size - self.bytes_produced
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.bytes_produced == self.header.size
    }

    /// Fraction produced in `[0.0, 1.0]`; `1.0` for an empty asset.
    pub fn percent_complete(&self) -> f64 {
        if self.header.size == 0 {
            return 1.0;
        }
        self.bytes_produced as f64 / self.header.size as f64
    }
}

impl AssetProducer<std::fs::File> {
    /// Opens `path` as the source for `header`.
    ///
    /// The file must be exactly `header.size` bytes long.
    pub fn from_file(
        header: AssetHeader,
        path: &Path,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        let open = |path: &Path| -> std::io::Result<(std::fs::File, u64)> {
            let file = std::fs::File::open(path)?;
            let len = file.metadata()?.len();
            Ok((file, len))
        };
        let (file, len) = open(path).map_err(|source| TransferError::SourceRead {
            key: header.id,
            source,
        })?;
        check_source_len(&header, len)?;
        Self::new(header, file, chunk_size)
    }
}

impl AssetProducer<Cursor<Vec<u8>>> {
    /// Produces chunks from an asset already held in memory.
    pub fn from_bytes(
        header: AssetHeader,
        data: Vec<u8>,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        check_source_len(&header, data.len() as u64)?;
        Self::new(header, Cursor::new(data), chunk_size)
    }
}

impl<R: AssetSource + 'static> AssetProducer<R> {
    /// Erases the source type.
    pub fn boxed(self) -> BoxedProducer {
        AssetProducer {
            header: self.header,
            source: Box::new(self.source),
            chunk_size: self.chunk_size,
            bytes_produced: self.bytes_produced,
            next_index: self.next_index,
        }
    }
}

impl<R: Read + Seek> Iterator for AssetProducer<R> {
    type Item = Result<AssetChunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.produce().transpose()
    }
}

fn check_source_len(header: &AssetHeader, len: u64) -> Result<(), TransferError> {
    if len != header.size {
        return Err(TransferError::InvalidArgument(format!(
            "source of asset {} is {len} bytes but header declares {}",
            header.id, header.size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use tempfile::TempDir;

    fn producer_for(data: &[u8], chunk_size: usize) -> AssetProducer<Cursor<Vec<u8>>> {
        let header = AssetHeader::for_bytes("test", data);
        AssetProducer::from_bytes(header, data.to_vec(), chunk_size).unwrap()
    }

    /// Reader that fails once its `fail_at`-th read is reached.
    struct FlakySource {
        inner: Cursor<Vec<u8>>,
        reads: usize,
        fail_at: usize,
    }

    impl Read for FlakySource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            if self.reads == self.fail_at {
                return Err(io::Error::other("disk went away"));
            }
            self.inner.read(buf)
        }
    }

    impl Seek for FlakySource {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn ten_bytes_in_four_byte_chunks() {
        let mut producer = producer_for(b"AABBCCDDEE", 4);

        let c1 = producer.produce().unwrap().unwrap();
        assert_eq!(&c1.data, b"AABB");
        assert_eq!(producer.bytes_produced(), 4);

        let c2 = producer.produce().unwrap().unwrap();
        assert_eq!(&c2.data, b"CCDD");

        let c3 = producer.produce().unwrap().unwrap();
        assert_eq!(&c3.data, b"EE");
        assert_eq!(producer.bytes_produced(), 10);
        assert!(producer.is_exhausted());

        assert!(producer.produce().unwrap().is_none());
        // End of sequence is sticky.
        assert!(producer.produce().unwrap().is_none());
    }

    #[test]
    fn chunks_carry_the_asset_key() {
        let mut producer = producer_for(b"0123456789", 3);
        let key = producer.header().id;
        for chunk in &mut producer {
            assert_eq!(chunk.unwrap().id, key);
        }
    }

    #[test]
    fn chunk_lengths_sum_to_size() {
        let data: Vec<u8> = (0..=255).cycle().take(10_001).collect();
        let producer = producer_for(&data, 1000);
        let lens: Vec<usize> = producer.map(|c| c.unwrap().len()).collect();
        assert_eq!(lens.len(), 11);
        assert!(lens.iter().all(|&l| l <= 1000));
        assert_eq!(lens.iter().sum::<usize>(), data.len());
    }

    #[test]
    fn zero_size_asset_produces_nothing() {
        let mut producer = producer_for(b"", 4);
        assert!(producer.is_exhausted());
        assert_eq!(producer.percent_complete(), 1.0);
        assert!(producer.produce().unwrap().is_none());
    }

    #[test]
    fn percent_complete_tracks_progress() {
        let mut producer = producer_for(b"0123456789", 5);
        assert_eq!(producer.percent_complete(), 0.0);
        producer.produce().unwrap();
        assert!((producer.percent_complete() - 0.5).abs() < f64::EPSILON);
        producer.produce().unwrap();
        assert_eq!(producer.percent_complete(), 1.0);
    }

    #[test]
    fn reset_restarts_from_scratch() {
        let mut producer = producer_for(b"abcdef", 4);
        let first: Vec<_> = (&mut producer).map(|c| c.unwrap().data).collect();
        assert!(producer.is_exhausted());

        producer.reset().unwrap();
        assert_eq!(producer.bytes_produced(), 0);
        let second: Vec<_> = producer.map(|c| c.unwrap().data).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn sequenced_chunks_number_and_offset() {
        let mut producer = producer_for(b"AABBCCDDEE", 4);
        let c0 = producer.produce_sequenced().unwrap().unwrap();
        let c1 = producer.produce_sequenced().unwrap().unwrap();
        let c2 = producer.produce_sequenced().unwrap().unwrap();
        assert_eq!((c0.index, c0.offset), (0, 0));
        assert_eq!((c1.index, c1.offset), (1, 4));
        assert_eq!((c2.index, c2.offset), (2, 8));
        assert_eq!(&c2.data, b"EE");
        assert!(producer.produce_sequenced().unwrap().is_none());
    }

    #[test]
    fn zero_chunk_size_is_invalid() {
        let header = AssetHeader::for_bytes("x", b"x");
        let result = AssetProducer::from_bytes(header, b"x".to_vec(), 0);
        assert!(matches!(result, Err(TransferError::InvalidArgument(_))));
    }

    #[test]
    fn size_mismatch_is_invalid() {
        let header = AssetHeader::for_bytes("x", b"abc");
        let result = AssetProducer::from_bytes(header, b"abcd".to_vec(), 2);
        assert!(matches!(result, Err(TransferError::InvalidArgument(_))));
    }

    #[test]
    fn read_failure_leaves_position_unchanged() {
        let data = b"0123456789".to_vec();
        let header = AssetHeader::for_bytes("flaky", &data);
        let source = FlakySource {
            inner: Cursor::new(data),
            reads: 0,
            fail_at: 2,
        };
        let mut producer = AssetProducer::new(header, source, 4).unwrap();

        assert_eq!(&producer.produce().unwrap().unwrap().data, b"0123");
        let err = producer.produce().unwrap_err();
        assert!(matches!(err, TransferError::SourceRead { .. }));
        assert_eq!(producer.bytes_produced(), 4);

        // The source recovers; the next chunk is the one that failed.
        assert_eq!(&producer.produce().unwrap().unwrap().data, b"4567");
        assert_eq!(&producer.produce().unwrap().unwrap().data, b"89");
    }

    #[test]
    fn truncated_source_is_a_read_error() {
        // Header claims more bytes than the source holds.
        let header = AssetHeader::new(assetlink_protocol::ContentKey::compute(b"x"), "short", 8);
        let mut producer = AssetProducer::new(header, Cursor::new(b"abcde".to_vec()), 4).unwrap();
        assert!(producer.produce().unwrap().is_some());
        assert!(matches!(
            producer.produce(),
            Err(TransferError::SourceRead { .. })
        ));
        assert_eq!(producer.bytes_produced(), 4);
    }

    #[test]
    fn from_file_reads_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.png");
        let data = b"The quick brown fox jumps over the lazy dog";
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();

        let header = AssetHeader::for_file(&path).unwrap();
        let producer = AssetProducer::from_file(header, &path, 10).unwrap();
        let out: Vec<u8> = producer.flat_map(|c| c.unwrap().data).collect();
        assert_eq!(&out, data);
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let dir = TempDir::new().unwrap();
        let header = AssetHeader::for_bytes("gone", b"abc");
        let result = AssetProducer::from_file(header, &dir.path().join("gone.png"), 4);
        assert!(matches!(result, Err(TransferError::SourceRead { .. })));
    }

    #[test]
    fn boxed_producer_behaves_the_same() {
        let mut producer = producer_for(b"hello world", 5).boxed();
        assert_eq!(producer.size(), 11);
        let chunks: Vec<_> = (&mut producer).map(|c| c.unwrap().len()).collect();
        assert_eq!(chunks, vec![5, 5, 1]);
        assert!(producer.is_exhausted());
    }
}
