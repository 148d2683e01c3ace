// ==============================================================================
// reader_pool.rs - Ordered Reader Pool
// ==============================================================================
// Description: Parallel line parsing with an order-restoring k-way merge
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Architecture (N >= 2 workers):
//
//   worker i  reads every line, parses lines with line_no % N == i
//        |    (bounded channel per worker)
//        v
//   merger    min-heap keyed by (line_no, sub_index), bounded by factor * N
//
// A record leaves the heap only when every live worker has at least one
// record pending in the heap, so nothing smaller can still arrive.
// ==============================================================================

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use flate2::read::MultiGzDecoder;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::ParsedRecord;
use crate::parser::{ColumnLayout, RecordParser};

/// Per-worker channel capacity, in messages (one message per input line)
const CHANNEL_CAPACITY: usize = 256;

/// Open a text input, transparently decompressing gzip and bgzip files
pub fn open_input(path: &Path) -> std::io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    let name = path.to_string_lossy();
    if name.ends_with(".gz") || name.ends_with(".bgz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Counters reported by each reader when its stream ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub records: u64,
    pub skipped: u64,
    /// Last line number seen by the reader
    pub lines: u64,
}

impl ReaderStats {
    fn add(&mut self, other: &ReaderStats) {
        self.records += other.records;
        self.skipped += other.skipped;
        self.lines = self.lines.max(other.lines);
    }
}

/// Messages from a reader worker to the merger
#[derive(Debug)]
pub enum ReaderMessage {
    /// Column layout, sent once before the first records
    Layout(ColumnLayout),
    /// All records parsed from one input line
    Records(Vec<ParsedRecord>),
    /// End of stream
    Done(ReaderStats),
    /// Unrecoverable failure; no further messages follow
    Failed(String),
}

/// Reads lines one at a time, replacing invalid UTF-8
struct LineSource {
    reader: Box<dyn BufRead + Send>,
    buf: Vec<u8>,
    line_no: u64,
}

impl LineSource {
    fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            reader: open_input(path)?,
            buf: Vec::with_capacity(1024),
            line_no: 0,
        })
    }

    /// Next line and its 1-based number, `None` at end of input
    fn next_line(&mut self) -> std::io::Result<Option<(u64, String)>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some((self.line_no, String::from_utf8_lossy(&self.buf).into_owned())))
    }
}

fn is_data_line(line: &str) -> bool {
    !line.starts_with('#') && !line.trim().is_empty()
}

/// Parse one line, counting recoverable errors as skipped
fn parse_line(
    parser: &mut RecordParser,
    line: &str,
    line_no: u64,
    stats: &mut ReaderStats,
) -> PipelineResult<Vec<ParsedRecord>> {
    if !is_data_line(line) {
        return Ok(Vec::new());
    }
    match parser.process(line, line_no) {
        Ok(records) => {
            stats.records += records.len() as u64;
            Ok(records)
        }
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            debug!("Skipping line {}: {}", line_no, e);
            stats.skipped += 1;
            Ok(Vec::new())
        }
    }
}

/// Body of a reader worker thread
fn reader_worker(
    mut parser: RecordParser,
    path: PathBuf,
    step: u64,
    index: u64,
    tx: Sender<ReaderMessage>,
) {
    let mut stats = ReaderStats::default();
    let result = (|| -> PipelineResult<()> {
        let mut source = LineSource::open(&path)?;
        while let Some((line_no, line)) = source.next_line()? {
            stats.lines = line_no;
            // every worker takes its layout from the first data line of the file
            if parser.layout().is_none() && is_data_line(&line) {
                parser.prepare(&line)?;
                if let Some(layout) = parser.layout() {
                    if tx.send(ReaderMessage::Layout(layout.clone())).is_err() {
                        return Ok(());
                    }
                }
            }
            if line_no % step != index {
                continue;
            }
            let records = parse_line(&mut parser, &line, line_no, &mut stats)?;
            if records.is_empty() {
                continue;
            }
            if tx.send(ReaderMessage::Records(records)).is_err() {
                // merger is gone, nothing left to do
                return Ok(());
            }
        }
        Ok(())
    })();
    let last = match result {
        Ok(()) => ReaderMessage::Done(stats),
        Err(e) => ReaderMessage::Failed(e.to_string()),
    };
    let _ = tx.send(last);
}

/// Heap item ordered by input position only
struct Pending {
    worker: usize,
    record: ParsedRecord,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.record.order_key() == other.record.order_key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record.order_key().cmp(&other.record.order_key())
    }
}

struct WorkerSlot {
    rx: Receiver<ReaderMessage>,
    pending: usize,
    live: bool,
}

/// K-way merge over the record streams of several workers
pub struct Merger {
    slots: Vec<WorkerSlot>,
    handles: Vec<JoinHandle<()>>,
    heap: BinaryHeap<Reverse<Pending>>,
    capacity: usize,
    layout: Option<ColumnLayout>,
    stats: ReaderStats,
}

impl Merger {
    /// Merge the given worker channels. `heap_factor` bounds the number of
    /// prefetched records to `heap_factor * workers`.
    pub fn new(receivers: Vec<Receiver<ReaderMessage>>, handles: Vec<JoinHandle<()>>, heap_factor: usize) -> Self {
        let capacity = heap_factor.max(1) * receivers.len().max(1);
        Self {
            slots: receivers
                .into_iter()
                .map(|rx| WorkerSlot {
                    rx,
                    pending: 0,
                    live: true,
                })
                .collect(),
            handles,
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
            layout: None,
            stats: ReaderStats::default(),
        }
    }

    fn accept(&mut self, worker: usize, message: ReaderMessage) -> PipelineResult<()> {
        match message {
            ReaderMessage::Layout(layout) => {
                if self.layout.is_none() {
                    self.layout = Some(layout);
                }
            }
            ReaderMessage::Records(records) => {
                self.slots[worker].pending += records.len();
                for record in records {
                    self.heap.push(Reverse(Pending { worker, record }));
                }
            }
            ReaderMessage::Done(stats) => {
                self.slots[worker].live = false;
                self.stats.add(&stats);
            }
            ReaderMessage::Failed(reason) => {
                self.slots[worker].live = false;
                return Err(PipelineError::WorkerFailed {
                    worker: format!("reader-{}", worker),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Block until `worker` has a pending record or has finished
    fn fill(&mut self, worker: usize) -> PipelineResult<()> {
        while self.slots[worker].live && self.slots[worker].pending == 0 {
            match self.slots[worker].rx.recv() {
                Ok(message) => self.accept(worker, message)?,
                Err(_) => {
                    // disconnected without a final message: the thread died
                    self.slots[worker].live = false;
                    return Err(PipelineError::WorkerPanicked(format!("reader-{}", worker)));
                }
            }
        }
        Ok(())
    }

    /// Top up the heap without blocking
    fn prefetch(&mut self) -> PipelineResult<()> {
        let mut progressed = true;
        while progressed && self.heap.len() < self.capacity {
            progressed = false;
            for worker in 0..self.slots.len() {
                if !self.slots[worker].live || self.heap.len() >= self.capacity {
                    continue;
                }
                match self.slots[worker].rx.try_recv() {
                    Ok(message) => {
                        self.accept(worker, message)?;
                        progressed = true;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => self.fill(worker)?,
                }
            }
        }
        Ok(())
    }

    fn next_record(&mut self) -> PipelineResult<Option<ParsedRecord>> {
        for worker in 0..self.slots.len() {
            self.fill(worker)?;
        }
        self.prefetch()?;
        match self.heap.pop() {
            Some(Reverse(item)) => {
                self.slots[item.worker].pending -= 1;
                Ok(Some(item.record))
            }
            None => {
                self.join()?;
                Ok(None)
            }
        }
    }

    fn join(&mut self) -> PipelineResult<()> {
        for (idx, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                return Err(PipelineError::WorkerPanicked(format!("reader-{}", idx)));
            }
        }
        Ok(())
    }
}

impl Drop for Merger {
    fn drop(&mut self) {
        // Closing the receivers unblocks workers stuck on a full channel
        self.slots.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn next_inline(
    parser: &mut RecordParser,
    lines: &mut LineSource,
    buffered: &mut VecDeque<ParsedRecord>,
    stats: &mut ReaderStats,
) -> PipelineResult<Option<ParsedRecord>> {
    loop {
        if let Some(record) = buffered.pop_front() {
            return Ok(Some(record));
        }
        match lines.next_line()? {
            Some((line_no, line)) => {
                stats.lines = line_no;
                let records = parse_line(parser, &line, line_no, stats)?;
                buffered.extend(records);
            }
            None => return Ok(None),
        }
    }
}

enum Source {
    Inline {
        parser: RecordParser,
        lines: LineSource,
        buffered: VecDeque<ParsedRecord>,
    },
    Workers(Merger),
}

/// Ordered stream of parsed records from one input file
///
/// With zero jobs lines are parsed on the calling thread, one job runs a
/// single reader thread, and more jobs stride lines across readers and
/// restore input order with a bounded merge.
pub struct OrderedRecords {
    source: Source,
    stats: ReaderStats,
    finished: bool,
}

impl OrderedRecords {
    pub fn open(parser: RecordParser, path: &Path, jobs: usize, heap_factor: usize) -> PipelineResult<Self> {
        let source = if jobs == 0 {
            Source::Inline {
                parser,
                lines: LineSource::open(path)?,
                buffered: VecDeque::new(),
            }
        } else {
            // fail early on unreadable input rather than inside a worker
            File::open(path)?;
            let mut receivers = Vec::with_capacity(jobs);
            let mut handles = Vec::with_capacity(jobs);
            for index in 0..jobs {
                let (tx, rx) = bounded(CHANNEL_CAPACITY);
                let worker_parser = parser.clone();
                let worker_path = path.to_path_buf();
                let handle = thread::Builder::new()
                    .name(format!("reader-{}", index))
                    .spawn(move || reader_worker(worker_parser, worker_path, jobs as u64, index as u64, tx))?;
                receivers.push(rx);
                handles.push(handle);
            }
            debug!("Started {} reader threads for {}", jobs, path.display());
            Source::Workers(Merger::new(receivers, handles, heap_factor))
        };
        Ok(Self {
            source,
            stats: ReaderStats::default(),
            finished: false,
        })
    }

    /// Layout of the input, known once the first record has been produced
    pub fn layout(&self) -> Option<&ColumnLayout> {
        match &self.source {
            Source::Inline { parser, .. } => parser.layout(),
            Source::Workers(merger) => merger.layout.as_ref(),
        }
    }

    /// Totals over all readers; complete once the stream is exhausted
    pub fn stats(&self) -> ReaderStats {
        match &self.source {
            Source::Inline { .. } => self.stats,
            Source::Workers(merger) => merger.stats,
        }
    }
}

impl Iterator for OrderedRecords {
    type Item = PipelineResult<ParsedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let next = match &mut self.source {
            Source::Inline {
                parser,
                lines,
                buffered,
            } => next_inline(parser, lines, buffered, &mut self.stats),
            Source::Workers(merger) => merger.next_record(),
        };
        match next {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                warn!("Reader pool stopped: {}", e);
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatSpec;
    use rand::{Rng, SeedableRng};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn toy_vcf(lines: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "##fileformat=VCFv4.2").unwrap();
        writeln!(file, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1").unwrap();
        for i in 0..lines {
            writeln!(file, "1\t{}\t.\tA\tG\t.\t.\t.\tGT\t0/1", 1000 + i).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn positions(path: &Path, jobs: usize) -> Vec<String> {
        let parser = RecordParser::new(&FormatSpec::vcf()).unwrap();
        OrderedRecords::open(parser, path, jobs, 4)
            .unwrap()
            .map(|r| r.unwrap().fields[1].clone().unwrap())
            .collect()
    }

    #[test]
    fn test_all_modes_preserve_input_order() {
        let file = toy_vcf(500);
        let inline = positions(file.path(), 0);
        assert_eq!(inline.len(), 500);
        assert_eq!(positions(file.path(), 1), inline);
        assert_eq!(positions(file.path(), 2), inline);
        assert_eq!(positions(file.path(), 5), inline);
    }

    #[test]
    fn test_six_lines_two_workers() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 1..=6 {
            writeln!(file, "1\t{}\t.\tC\tT\t.\t.\t.\tGT\t1/1", i * 10).unwrap();
        }
        file.flush().unwrap();
        let parser = RecordParser::new(&FormatSpec::vcf()).unwrap();
        let mut records = OrderedRecords::open(parser, file.path(), 2, 4).unwrap();
        let lines: Vec<u64> = records.by_ref().map(|r| r.unwrap().line_no).collect();
        assert_eq!(lines, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(records.stats().records, 6);
        assert_eq!(records.layout().unwrap().num_samples, Some(1));
    }

    #[test]
    fn test_skipped_lines_are_counted_across_workers() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "1\t10\t.\tA\tG\t.\t.\t.\tGT\t0/1").unwrap();
        writeln!(file, "1\tbad\t.\tA\tG\t.\t.\t.\tGT\t0/1").unwrap();
        writeln!(file, "1\t30\t.\tA\tG").unwrap();
        writeln!(file, "1\t40\t.\tA\tG\t.\t.\t.\tGT\t0/1").unwrap();
        file.flush().unwrap();
        for jobs in [0, 3] {
            let parser = RecordParser::new(&FormatSpec::vcf()).unwrap();
            let mut records = OrderedRecords::open(parser, file.path(), jobs, 4).unwrap();
            let lines: Vec<u64> = records.by_ref().map(|r| r.unwrap().line_no).collect();
            assert_eq!(lines, vec![1, 4]);
            let stats = records.stats();
            assert_eq!(stats.records, 2);
            assert_eq!(stats.skipped, 2);
        }
    }

    #[test]
    fn test_non_ascii_allele_is_skipped_by_workers() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "1\t10\t.\tA\tG\t.\t.\t.\tGT\t0/1").unwrap();
        writeln!(file, "1\t100\t.\té\tê\t.\t.\t.\tGT\t0/1").unwrap();
        writeln!(file, "1\t30\t.\tC\tT\t.\t.\t.\tGT\t1/1").unwrap();
        file.flush().unwrap();
        for jobs in [0, 2] {
            let parser = RecordParser::new(&FormatSpec::vcf()).unwrap();
            let mut records = OrderedRecords::open(parser, file.path(), jobs, 4).unwrap();
            let lines: Vec<u64> = records.by_ref().map(|r| r.unwrap().line_no).collect();
            assert_eq!(lines, vec![1, 3]);
            assert_eq!(records.stats().skipped, 1);
        }
    }

    #[test]
    fn test_merge_with_uneven_worker_speeds() {
        const WORKERS: usize = 4;
        const LINES: u64 = 400;
        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for index in 0..WORKERS as u64 {
            let (tx, rx) = bounded(8);
            receivers.push(rx);
            handles.push(thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(index);
                let mut stats = ReaderStats::default();
                for line_no in (1..=LINES).filter(|l| l % WORKERS as u64 == index) {
                    // lines divisible by 7 expand into two records, by 5 into none
                    let width = if line_no % 7 == 0 { 2 } else if line_no % 5 == 0 { 0 } else { 1 };
                    let records: Vec<ParsedRecord> = (0..width)
                        .map(|sub| ParsedRecord {
                            line_no,
                            sub_index: sub,
                            bin: None,
                            fields: Vec::new(),
                        })
                        .collect();
                    stats.records += records.len() as u64;
                    if rng.gen_bool(0.3) {
                        thread::sleep(Duration::from_micros(rng.gen_range(10..500)));
                    }
                    if !records.is_empty() {
                        tx.send(ReaderMessage::Records(records)).unwrap();
                    }
                }
                tx.send(ReaderMessage::Done(stats)).unwrap();
            }));
        }
        let mut merger = Merger::new(receivers, handles, 4);
        let mut keys = Vec::new();
        while let Some(record) = merger.next_record().unwrap() {
            keys.push(record.order_key());
            assert!(merger.heap.len() <= merger.capacity + 2 * WORKERS);
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len() as u64, merger.stats.records);
    }

    #[test]
    fn test_worker_failure_is_reported() {
        let (tx, rx) = bounded(4);
        let handle = thread::spawn(move || {
            tx.send(ReaderMessage::Failed("disk went away".into())).unwrap();
        });
        let mut merger = Merger::new(vec![rx], vec![handle], 4);
        let err = merger.next_record().unwrap_err();
        assert!(matches!(err, PipelineError::WorkerFailed { .. }));
    }

    #[test]
    fn test_gzip_input() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.vcf.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        writeln!(encoder, "1\t10\t.\tA\tG\t.\t.\t.\tGT\t0/1").unwrap();
        encoder.finish().unwrap();
        assert_eq!(positions(&path, 0), vec!["10".to_string()]);
    }
}
