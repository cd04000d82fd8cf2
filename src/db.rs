//! The hash log stores, per build output, the content hashes of the inputs
//! that produced it, so a build can be skipped when an input's mtime changed
//! but its content did not.
//!
//! The log is a single append-only binary file.  Two record kinds: id
//! records associate a path with a small integer, hash records associate an
//! output id with the (id, mtime, hash) triple of each of its inputs.
//! Updates are modeled as appended records that supersede earlier ones for
//! the same output; when too much of the file is superseded it is rewritten
//! from live state and atomically swapped into place.

use crate::densemap::{self, DenseMap};
use crate::fs::{FileStat, FileSystem};
use crate::graph::{Build, FileId, FileState, Graph};
use crate::hash::{FileHasher, Hash};
use crate::trace;
use anyhow::{anyhow, bail};
use hashbrown::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};

/// Name of the log file, relative to the build directory.
pub const DEFAULT_FILENAME: &str = ".ninja_hashes";

const FILE_SIGNATURE: &[u8] = b"# ninjahash\n";
const CURRENT_VERSION: u32 = 5;
/// Record payloads are capped so a corrupt size field can't make the loader
/// allocate unbounded memory.
const MAX_RECORD_SIZE: u32 = (1 << 19) - 1;
/// High bit of the record size field distinguishes hash records from id
/// records.
const HASH_RECORD_MASK: u32 = 0x8000_0000;

const MIN_COMPACTION_COUNT: usize = 1000;
const COMPACTION_RATIO: usize = 3;

/// Files are represented as integer ids that are stable across executions of
/// the logging process, allocated densely from 0 in file order.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(usize);
impl From<usize> for Id {
    fn from(u: usize) -> Id {
        Id(u)
    }
}
impl densemap::Index for Id {
    fn index(&self) -> usize {
        self.0
    }
}

/// The last computed hash of a file, and the stat at which it was computed.
/// The hash is only recomputed when the mtime differs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HashRecord {
    pub mtime: u32,
    /// File size when the hash was computed.  Kept in memory only; entries
    /// learned from the log carry zero here.
    pub size: u32,
    pub value: Hash,
}

/// One recorded input of an output: the on-disk (id, mtime, hash) triple.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InputRecord {
    pub id: Id,
    pub mtime: u32,
    pub value: Hash,
}

/// The recorded inputs of one output, sorted by input id, ids unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRecord {
    pub inputs: Vec<InputRecord>,
}

/// The hash log.  Load() replays the on-disk state; open_for_write() is
/// required before anything can be recorded.
pub struct HashLog<'a> {
    hasher: &'a dyn FileHasher,
    file: Option<BufWriter<File>>,
    /// Maps log Id to the graph's FileId.
    fileids: Vec<FileId>,
    /// Maps FileId to log Id.
    ids: HashMap<FileId, Id>,
    /// Last computed hash of each file, by id.
    hashes: DenseMap<Id, Option<HashRecord>>,
    /// Recorded inputs of each output, by id.
    outputs: DenseMap<Id, Option<OutputRecord>>,
    needs_recompaction: bool,
}

/// Write one full record and flush, so a crash can tear at most the record
/// at the tail of the file.
fn write_record(w: &mut BufWriter<File>, buf: &[u8]) -> std::io::Result<()> {
    w.write_all(buf)?;
    w.flush()
}

fn encode_id_record(path: &str, id: Id) -> anyhow::Result<Vec<u8>> {
    assert!(!path.is_empty(), "no name");
    // Pad the path to a 4 byte boundary so the checksum is aligned.
    let padding = (4 - path.len() % 4) % 4;
    let size = path.len() + padding + 4;
    if size > MAX_RECORD_SIZE as usize {
        bail!("id record too large: {} byte path", path.len());
    }
    let mut buf = Vec::with_capacity(4 + size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(&[0u8; 3][..padding]);
    // The checksum doubles as the assigned id: replaying id records in file
    // order must yield ids 0, 1, 2, ...
    let checksum = !(id.0 as u32);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

fn encode_hash_record(id: Id, record: &OutputRecord) -> anyhow::Result<Vec<u8>> {
    let size = 4 + 12 * record.inputs.len();
    if size > MAX_RECORD_SIZE as usize {
        bail!("hash record too large: {} inputs", record.inputs.len());
    }
    let mut buf = Vec::with_capacity(4 + size);
    buf.extend_from_slice(&(size as u32 | HASH_RECORD_MASK).to_le_bytes());
    buf.extend_from_slice(&(id.0 as u32).to_le_bytes());
    for input in &record.inputs {
        buf.extend_from_slice(&(input.id.0 as u32).to_le_bytes());
        buf.extend_from_slice(&input.mtime.to_le_bytes());
        buf.extend_from_slice(&input.value.0.to_le_bytes());
    }
    Ok(buf)
}

/// Get the current hash of a file, recomputing it only if the file's mtime
/// differs from the cache entry's.  A free function over the cache rather
/// than a method so callers can hold borrows of other HashLog fields.
fn compute_hash(
    hashes: &mut DenseMap<Id, Option<HashRecord>>,
    hasher: &dyn FileHasher,
    path: &str,
    mtime: u32,
    size: u32,
    id: Id,
) -> anyhow::Result<HashRecord> {
    let cached = hashes.get_mut_grow(id, None);
    match cached {
        Some(record) if record.mtime == mtime => Ok(*record),
        _ => {
            let value = match hasher.hash_file(path) {
                Ok(value) => value,
                Err(err) => bail!("error hashing file: {}: {}", path, err),
            };
            let record = HashRecord { mtime, size, value };
            *cached = Some(record);
            Ok(record)
        }
    }
}

/// Reads the log record by record, tracking the offset of the last record
/// boundary so a torn tail can be truncated away.
struct RecordReader {
    r: BufReader<File>,
    ofs: u64,
}

impl RecordReader {
    /// Read the next record's size field.  None at a clean end of file; a
    /// partial read is an UnexpectedEof error (a torn size field).
    fn read_size(&mut self) -> std::io::Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut n = 0;
        while n < buf.len() {
            let read = self.r.read(&mut buf[n..])?;
            if read == 0 {
                break;
            }
            n += read;
        }
        match n {
            0 => Ok(None),
            4 => {
                self.ofs += 4;
                Ok(Some(u32::from_le_bytes(buf)))
            }
            _ => Err(std::io::ErrorKind::UnexpectedEof.into()),
        }
    }

    fn read_payload(&mut self, size: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0; size];
        self.r.read_exact(&mut buf)?;
        self.ofs += size as u64;
        Ok(buf)
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[..4].try_into().unwrap())
}

impl<'a> HashLog<'a> {
    pub fn new(hasher: &'a dyn FileHasher) -> HashLog<'a> {
        HashLog {
            hasher,
            file: None,
            fileids: Vec::new(),
            ids: HashMap::new(),
            hashes: DenseMap::new(),
            outputs: DenseMap::new(),
            needs_recompaction: false,
        }
    }

    /// The log id for a file, if the file has ever appeared in the log.
    pub fn id_of(&self, fileid: FileId) -> Option<Id> {
        self.ids.get(&fileid).copied()
    }

    /// The last known content hash of a file.
    pub fn cached_hash(&self, id: Id) -> Option<HashRecord> {
        self.hashes.lookup(id).copied().flatten()
    }

    /// The recorded input snapshot of an output.
    pub fn snapshot(&self, id: Id) -> Option<&OutputRecord> {
        match self.outputs.lookup(id) {
            Some(Some(record)) => Some(record),
            _ => None,
        }
    }

    /// Number of ids the log has allocated so far.
    pub fn id_count(&self) -> usize {
        self.fileids.len()
    }

    pub fn needs_recompaction(&self) -> bool {
        self.needs_recompaction
    }

    pub fn close(&mut self) {
        // Every record was flushed as it was written, so dropping the
        // writer has nothing left to flush.
        self.file = None;
    }

    /// Replay an on-disk log into memory.  A missing file is an empty log.
    /// Corruption is repaired by truncating back to the last good record;
    /// that and format mismatches are reported as a warning string, not an
    /// error, because the worst outcome is a redundant rebuild.
    pub fn load(&mut self, path: &str, graph: &mut Graph) -> anyhow::Result<Option<String>> {
        trace::scope(".ninja_hashes load", || self.load_inner(path, graph))
    }

    fn load_inner(&mut self, path: &str, graph: &mut Graph) -> anyhow::Result<Option<String>> {
        let f = match File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => bail!("open {}: {}", path, err),
        };
        let mut r = RecordReader {
            r: BufReader::new(f),
            ofs: 0,
        };

        let mut header = [0u8; 16];
        let valid_header = match r.r.read_exact(&mut header) {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => false,
            Err(err) => bail!("read {}: {}", path, err),
        };
        let valid_signature = valid_header && header[..12] == *FILE_SIGNATURE;
        let version = read_u32(&header[12..]);
        if !valid_signature || version != CURRENT_VERSION {
            drop(r);
            std::fs::remove_file(path).map_err(|err| anyhow!("remove {}: {}", path, err))?;
            let warning = if valid_signature && version > 0 && version < CURRENT_VERSION {
                "hash log version change; rebuilding"
            } else {
                "bad hash log signature or version; starting over"
            };
            return Ok(Some(warning.to_owned()));
        }
        r.ofs = header.len() as u64;

        let mut total_records = 0usize;
        let mut failure: Option<String> = None;
        let mut valid_offset;
        loop {
            valid_offset = r.ofs;
            let size = match r.read_size() {
                Ok(None) => break,
                Ok(Some(size)) => size,
                Err(err) => {
                    failure = Some(describe_read_error(err));
                    break;
                }
            };
            let is_hash = size & HASH_RECORD_MASK != 0;
            let size = size & !HASH_RECORD_MASK;
            if size > MAX_RECORD_SIZE {
                failure = Some("oversize record".to_owned());
                break;
            }
            let payload = match r.read_payload(size as usize) {
                Ok(payload) => payload,
                Err(err) => {
                    failure = Some(describe_read_error(err));
                    break;
                }
            };
            let result = if is_hash {
                total_records += 1;
                self.parse_hash_record(&payload)
            } else {
                self.parse_id_record(graph, &payload)
            };
            if let Err(reason) = result {
                failure = Some(reason.to_owned());
                break;
            }
        }

        if let Some(reason) = failure {
            // Try to recover by truncating the file back to the last fully
            // parsed record; everything read before it is kept.
            drop(r);
            let f = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|err| anyhow!("truncate {}: {}", path, err))?;
            f.set_len(valid_offset)
                .map_err(|err| anyhow!("truncate {}: {}", path, err))?;
            return Ok(Some(format!("{}; recovering", reason)));
        }

        // Flag a rewrite when most of the log is superseded records.
        let live = self
            .outputs
            .iter()
            .filter(|(_, o)| matches!(o, Some(record) if !record.inputs.is_empty()))
            .count();
        if total_records > MIN_COMPACTION_COUNT && total_records > live * COMPACTION_RATIO {
            self.needs_recompaction = true;
        }

        Ok(None)
    }

    fn parse_id_record(&mut self, graph: &mut Graph, payload: &[u8]) -> Result<(), &'static str> {
        if payload.len() < 8 || payload.len() % 4 != 0 {
            return Err("corrupt id record");
        }
        let checksum = read_u32(&payload[payload.len() - 4..]);
        // Strip the alignment padding off the path.
        let mut path_end = payload.len() - 4;
        for _ in 0..3 {
            if path_end > 0 && payload[path_end - 1] == 0 {
                path_end -= 1;
            }
        }
        let path = match std::str::from_utf8(&payload[..path_end]) {
            Ok(path) if !path.is_empty() => path,
            _ => return Err("corrupt id record"),
        };
        if (!checksum) as usize != self.fileids.len() {
            return Err("id record out of sequence");
        }
        let fileid = graph.file_id(path);
        self.ids.insert(fileid, Id(self.fileids.len()));
        self.fileids.push(fileid);
        Ok(())
    }

    fn parse_hash_record(&mut self, payload: &[u8]) -> Result<(), &'static str> {
        // An output id plus at least one (id, mtime, hash) triple.
        if payload.len() < 16 || (payload.len() - 4) % 12 != 0 {
            return Err("corrupt hash record");
        }
        let output_id = read_u32(payload) as usize;
        if output_id >= self.fileids.len() {
            return Err("hash record for unknown id");
        }
        let mut inputs = Vec::with_capacity((payload.len() - 4) / 12);
        let mut prev: Option<usize> = None;
        for triple in payload[4..].chunks_exact(12) {
            let id = read_u32(triple) as usize;
            let mtime = read_u32(&triple[4..]);
            let value = Hash(read_u32(&triple[8..]));
            if id >= self.fileids.len() {
                return Err("hash record for unknown id");
            }
            // Inputs must be sorted by id, without duplicates.
            if prev.is_some_and(|prev| id <= prev) {
                return Err("hash record inputs out of order");
            }
            prev = Some(id);
            inputs.push(InputRecord {
                id: Id(id),
                mtime,
                value,
            });
            // The latest record to mention a file carries the latest
            // observed mtime, so the cache can learn the freshest hash of
            // each file without rereading anything.
            self.adopt_hash(
                Id(id),
                HashRecord {
                    mtime,
                    size: 0,
                    value,
                },
            );
        }
        self.outputs
            .set_grow(Id(output_id), Some(OutputRecord { inputs }), None);
        Ok(())
    }

    /// Install a hash cache entry unless a newer one is already present.
    fn adopt_hash(&mut self, id: Id, hash: HashRecord) {
        let cached = self.hashes.get_mut_grow(id, None);
        match cached {
            Some(existing) if existing.mtime >= hash.mtime => {}
            _ => *cached = Some(hash),
        }
    }

    /// Open the log for appending, rewriting it first if load() found it
    /// mostly superseded.  Writes the header on a fresh file.
    pub fn open_for_write(&mut self, path: &str, graph: &Graph) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path, graph)?;
        }
        let f = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| anyhow!("open {}: {}", path, err))?;
        // std opens with O_CLOEXEC, so the fd doesn't leak into build tasks.
        let len = f.metadata()?.len();
        let mut w = BufWriter::with_capacity(MAX_RECORD_SIZE as usize + 1, f);
        if len == 0 {
            w.write_all(FILE_SIGNATURE)?;
            w.write_all(&CURRENT_VERSION.to_le_bytes())?;
            w.flush()?;
        }
        self.file = Some(w);
        Ok(())
    }

    /// Allocate an id for a file, persisting the assignment on first sight.
    /// The write must land before the in-memory maps change: a failed write
    /// must not leave an allocated id behind.
    fn get_or_create_id(&mut self, graph: &Graph, fileid: FileId) -> anyhow::Result<Id> {
        if let Some(&id) = self.ids.get(&fileid) {
            return Ok(id);
        }
        let id = Id(self.fileids.len());
        let w = match self.file.as_mut() {
            Some(w) => w,
            None => bail!("hash log not open for write"),
        };
        let buf = encode_id_record(&graph.file(fileid).name, id)?;
        write_record(w, &buf)?;
        self.ids.insert(fileid, id);
        self.fileids.push(fileid);
        Ok(id)
    }

    /// Hash the dirtying inputs of a finished build and record the result
    /// for each of its outputs.  Inputs already hashed at their current
    /// mtime are not reread; an output whose recorded inputs are unchanged
    /// is not rewritten.
    pub fn record_hashes(
        &mut self,
        graph: &Graph,
        file_state: &mut FileState,
        build: &Build,
        fs: &dyn FileSystem,
    ) -> anyhow::Result<()> {
        trace::scope("recording hashes", || {
            let mut inputs: Vec<InputRecord> = Vec::with_capacity(build.dirtying_ins().len());
            for &fileid in build.dirtying_ins() {
                let id = self.get_or_create_id(graph, fileid)?;
                let name = &graph.file(fileid).name;
                // Refresh the stat so the recorded mtime matches the content
                // we hash.
                let (mtime, size) = match file_state.stat(graph, fileid, fs)? {
                    FileStat::File { mtime, size } => (mtime, size),
                    FileStat::Missing => bail!("error hashing file: {}: missing", name),
                };
                let record = compute_hash(&mut self.hashes, self.hasher, name, mtime, size, id)?;
                inputs.push(InputRecord {
                    id,
                    mtime: record.mtime,
                    value: record.value,
                });
            }
            // A file listed twice collapses to one entry.
            inputs.sort_unstable_by_key(|input| input.id);
            inputs.dedup_by_key(|input| input.id);

            for &out in &build.outs {
                self.record_output(graph, out, &inputs)?;
            }
            Ok(())
        })
    }

    /// Store the input set for one output, appending a hash record if it
    /// differs from what's already recorded.  Empty input sets live only in
    /// memory; they are never written.
    fn record_output(
        &mut self,
        graph: &Graph,
        out: FileId,
        inputs: &[InputRecord],
    ) -> anyhow::Result<()> {
        let id = self.get_or_create_id(graph, out)?;
        if let Some(Some(record)) = self.outputs.lookup(id) {
            if record.inputs == inputs {
                return Ok(());
            }
        }
        let record = OutputRecord {
            inputs: inputs.to_vec(),
        };
        if !record.inputs.is_empty() {
            let w = match self.file.as_mut() {
                Some(w) => w,
                None => bail!("hash log not open for write"),
            };
            let buf = encode_hash_record(id, &record)?;
            write_record(w, &buf)?;
        }
        self.outputs.set_grow(id, Some(record), None);
        Ok(())
    }

    /// Decide whether an output is up to date with respect to the current
    /// content of the given build's inputs.  Inputs whose mtime matches the
    /// record are clean without being read; the first dirty input ends the
    /// check, so one changed file costs at most one reread.
    ///
    /// An input set smaller than what was recorded is not dirty by itself:
    /// removing an input changes the command line, which the engine tracks
    /// separately.
    pub fn hashes_are_clean(
        &mut self,
        graph: &Graph,
        file_state: &FileState,
        output: FileId,
        build: &Build,
    ) -> anyhow::Result<bool> {
        trace::scope("checking hashes", || {
            let out_id = match self.ids.get(&output) {
                Some(&id) => id,
                None => return Ok(false),
            };
            if self.snapshot(out_id).is_none() {
                return Ok(false);
            }

            let mut is_clean = true;
            let mut should_rewrite = false;
            for &fileid in build.dirtying_ins() {
                // A missing or never-stat()ed input can't be clean.
                let (mtime, size) = match file_state.get(fileid) {
                    Some(FileStat::File { mtime, size }) => (mtime, size),
                    _ => {
                        is_clean = false;
                        break;
                    }
                };
                let in_id = match self.ids.get(&fileid) {
                    Some(&id) => id,
                    None => {
                        is_clean = false;
                        break;
                    }
                };
                let record = self.outputs.get(out_id).as_ref().unwrap();
                let idx = match record.inputs.binary_search_by_key(&in_id, |input| input.id) {
                    Ok(idx) => idx,
                    // Never seen as an input of this output.
                    Err(_) => {
                        is_clean = false;
                        break;
                    }
                };
                let recorded = record.inputs[idx];
                if mtime == recorded.mtime {
                    continue;
                }
                let name = &graph.file(fileid).name;
                let hash = compute_hash(&mut self.hashes, self.hasher, name, mtime, size, in_id)?;
                if hash.value != recorded.value {
                    is_clean = false;
                    break;
                }
                // Same content at a new mtime.  Update the record so the
                // next check can skip the rehash.
                let record = self.outputs.get_mut(out_id).as_mut().unwrap();
                record.inputs[idx].mtime = hash.mtime;
                should_rewrite = true;
            }

            // The refreshed mtimes are valid observations even when a later
            // input turned out dirty, so persist them whenever we can.
            if should_rewrite {
                if let Some(w) = self.file.as_mut() {
                    let record = self.outputs.get(out_id).as_ref().unwrap();
                    let buf = encode_hash_record(out_id, record)?;
                    write_record(w, &buf)?;
                }
            }

            Ok(is_clean)
        })
    }

    /// Rewrite the log with only live state: one id record per file still
    /// referenced and one hash record per output whose build still wants
    /// hashing.  The rewrite goes to a temp file that atomically replaces
    /// the log; a failure anywhere leaves the original intact.
    pub fn recompact(&mut self, path: &str, graph: &Graph) -> anyhow::Result<()> {
        trace::scope("recompacting", || {
            self.close();
            let temp_path = format!("{}.recompact", path);
            // A crashed earlier attempt may have left a file behind, and
            // open_for_write appends.
            if let Err(err) = std::fs::remove_file(&temp_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    bail!("remove {}: {}", temp_path, err);
                }
            }

            let mut new_log = HashLog::new(self.hasher);
            new_log.open_for_write(&temp_path, graph)?;

            for (&fileid, &old_id) in self.ids.iter() {
                // Only outputs whose build still wants hashing stay live.
                let build = match graph.file(fileid).input {
                    Some(bid) => graph.build(bid),
                    None => continue,
                };
                if !build.hash_input {
                    continue;
                }
                let record = match self.snapshot(old_id) {
                    Some(record) if !record.inputs.is_empty() => record,
                    _ => continue,
                };

                // Re-derive the inputs from the current build definition,
                // keeping those with a known hash; an input added since the
                // last record has none and stays unrecorded.
                let mut inputs = Vec::new();
                for &in_fileid in build.dirtying_ins() {
                    let in_old_id = match self.ids.get(&in_fileid) {
                        Some(&id) => id,
                        None => continue,
                    };
                    let idx = match record.inputs.binary_search_by_key(&in_old_id, |i| i.id) {
                        Ok(idx) => idx,
                        Err(_) => continue,
                    };
                    let old_input = record.inputs[idx];
                    let new_id = new_log.get_or_create_id(graph, in_fileid)?;
                    if let Some(hash) = self.cached_hash(in_old_id) {
                        new_log.adopt_hash(new_id, hash);
                    }
                    inputs.push(InputRecord {
                        id: new_id,
                        mtime: old_input.mtime,
                        value: old_input.value,
                    });
                }
                inputs.sort_unstable_by_key(|input| input.id);
                inputs.dedup_by_key(|input| input.id);
                new_log.record_output(graph, fileid, &inputs)?;
            }

            new_log.close();

            // The new log's compact numbering replaces ours wholesale.
            self.fileids = new_log.fileids;
            self.ids = new_log.ids;
            self.hashes = new_log.hashes;
            self.outputs = new_log.outputs;
            self.needs_recompaction = false;

            std::fs::remove_file(path).map_err(|err| anyhow!("remove {}: {}", path, err))?;
            std::fs::rename(&temp_path, path)
                .map_err(|err| anyhow!("rename {}: {}", temp_path, err))?;
            Ok(())
        })
    }
}

fn describe_read_error(err: std::io::Error) -> String {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        "premature end of file".to_owned()
    } else {
        err.to_string()
    }
}
