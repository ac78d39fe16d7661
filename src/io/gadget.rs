//! Gadget binary container format parser.
//!
//! A Gadget file is a sequence of named blocks. Two variants exist:
//! - Format 2 ("self-describing"): each block is wrapped as
//!   `[u32 8][4-byte name][u32 len+8][u32 8][payload][u32 len]`
//! - Format 1 ("legacy"): each block is `[u32 len][payload][u32 len]` and
//!   block names come from an ordered configuration list
//!
//! The first four raw bytes of the file identify the variant and byte
//! order: 8 (format 2) or 256 (format 1) in native order, or their
//! byte-swapped forms for foreign-order files.
//!
//! Element types are never stored on disk; they are inferred per block from
//! the block length and the header particle count. This is a closed
//! heuristic and can silently misclassify nonstandard blocks; no stronger
//! guarantee exists in the format.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::GadgetConfig;

/// Number of particle types. Fixed by the format; too many things break if
/// it is not 6.
pub const N_TYPE: usize = 6;

const HEADER_SIZE: u64 = 256;
/// Reserved tail of the 256-byte header, preserved verbatim on rewrite.
const HEADER_PAD: usize = 48;

/// Errors raised by the container format layer.
#[derive(Debug, Error)]
pub enum GadgetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized magic number {0} (not a Gadget file)")]
    Format(u32),

    #[error("corrupt block record in {file}: {reason}")]
    CorruptBlock { file: PathBuf, reason: String },

    #[error("{file} is format 1 and contains more blocks than names configured")]
    MissingBlockName { file: PathBuf },

    #[error("no particle-type subset explains length {length} of block {name}")]
    AmbiguousPresence { name: String, length: u64 },

    #[error("block {0} not present in file")]
    MissingBlock(String),

    #[error("block {name} has room for {capacity} elements, {requested} given")]
    SizeMismatch {
        name: String,
        capacity: u64,
        requested: u64,
    },

    #[error("block {name} stores {expected:?} data, {given:?} given")]
    TypeMismatch {
        name: String,
        expected: BlockType,
        given: BlockType,
    },

    #[error("block {0} already present in file")]
    BlockExists(String),
}

/// Byte order of a file, possibly different from the machine's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn is_native(self) -> bool {
        self == Self::native()
    }

    fn swapped() -> Self {
        match Self::native() {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        }
    }

    pub fn read_u32(self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        }
    }

    pub fn read_i32(self, b: &[u8]) -> i32 {
        match self {
            Endian::Little => LittleEndian::read_i32(b),
            Endian::Big => BigEndian::read_i32(b),
        }
    }

    pub fn read_f32(self, b: &[u8]) -> f32 {
        match self {
            Endian::Little => LittleEndian::read_f32(b),
            Endian::Big => BigEndian::read_f32(b),
        }
    }

    pub fn read_f64(self, b: &[u8]) -> f64 {
        match self {
            Endian::Little => LittleEndian::read_f64(b),
            Endian::Big => BigEndian::read_f64(b),
        }
    }

    pub fn write_u32(self, b: &mut [u8], v: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(b, v),
            Endian::Big => BigEndian::write_u32(b, v),
        }
    }

    pub fn write_i32(self, b: &mut [u8], v: i32) {
        match self {
            Endian::Little => LittleEndian::write_i32(b, v),
            Endian::Big => BigEndian::write_i32(b, v),
        }
    }

    pub fn write_f32(self, b: &mut [u8], v: f32) {
        match self {
            Endian::Little => LittleEndian::write_f32(b, v),
            Endian::Big => BigEndian::write_f32(b, v),
        }
    }

    pub fn write_f64(self, b: &mut [u8], v: f64) {
        match self {
            Endian::Little => LittleEndian::write_f64(b, v),
            Endian::Big => BigEndian::write_f64(b, v),
        }
    }
}

/// Inferred element type of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    F32,
    F64,
    I32,
    I64,
}

impl BlockType {
    pub fn size(self) -> u64 {
        match self {
            BlockType::F32 | BlockType::I32 => 4,
            BlockType::F64 | BlockType::I64 => 8,
        }
    }

    /// Numeric kind, the only thing write validation compares: casts within
    /// a kind are allowed, float/int mixups are not.
    fn is_float(self) -> bool {
        matches!(self, BlockType::F32 | BlockType::F64)
    }
}

/// Typed block payload. Byte-faithful: reading and rewriting a block of
/// the same type round-trips bit-identically.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl BlockData {
    pub fn len(&self) -> usize {
        match self {
            BlockData::F32(v) => v.len(),
            BlockData::F64(v) => v.len(),
            BlockData::I32(v) => v.len(),
            BlockData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> BlockType {
        match self {
            BlockData::F32(_) => BlockType::F32,
            BlockData::F64(_) => BlockType::F64,
            BlockData::I32(_) => BlockType::I32,
            BlockData::I64(_) => BlockType::I64,
        }
    }

    /// Append another payload, casting into this payload's element type.
    pub fn append(&mut self, other: &BlockData) {
        match self {
            BlockData::F32(v) => v.extend(other.cast_f32()),
            BlockData::F64(v) => v.extend(other.cast_f64()),
            BlockData::I32(v) => v.extend(other.cast_i32()),
            BlockData::I64(v) => v.extend(other.cast_i64()),
        }
    }

    /// Copy of the elements `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> BlockData {
        match self {
            BlockData::F32(v) => BlockData::F32(v[start..start + len].to_vec()),
            BlockData::F64(v) => BlockData::F64(v[start..start + len].to_vec()),
            BlockData::I32(v) => BlockData::I32(v[start..start + len].to_vec()),
            BlockData::I64(v) => BlockData::I64(v[start..start + len].to_vec()),
        }
    }

    /// Widening view as f64, for the analysis layers.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            BlockData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            BlockData::F64(v) => v.clone(),
            BlockData::I32(v) => v.iter().map(|&x| x as f64).collect(),
            BlockData::I64(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    fn decode(bytes: &[u8], dtype: BlockType, endian: Endian) -> BlockData {
        let n = bytes.len() / dtype.size() as usize;
        macro_rules! read_all {
            ($t:ty, $read:ident) => {{
                let mut out = vec![<$t>::default(); n];
                match endian {
                    Endian::Little => LittleEndian::$read(bytes, &mut out),
                    Endian::Big => BigEndian::$read(bytes, &mut out),
                }
                out
            }};
        }
        match dtype {
            BlockType::F32 => BlockData::F32(read_all!(f32, read_f32_into)),
            BlockType::F64 => BlockData::F64(read_all!(f64, read_f64_into)),
            BlockType::I32 => BlockData::I32(read_all!(i32, read_i32_into)),
            BlockType::I64 => BlockData::I64(read_all!(i64, read_i64_into)),
        }
    }

    /// Serialize as `dtype` elements in the given byte order, casting
    /// within the numeric kind where needed.
    fn encode(&self, dtype: BlockType, endian: Endian) -> Vec<u8> {
        macro_rules! write_all {
            ($src:expr, $write:ident) => {{
                let src = $src;
                let mut out = vec![0u8; src.len() * dtype.size() as usize];
                match endian {
                    Endian::Little => LittleEndian::$write(&src, &mut out),
                    Endian::Big => BigEndian::$write(&src, &mut out),
                }
                out
            }};
        }
        match dtype {
            BlockType::F32 => write_all!(self.cast_f32(), write_f32_into),
            BlockType::F64 => write_all!(self.cast_f64(), write_f64_into),
            BlockType::I32 => write_all!(self.cast_i32(), write_i32_into),
            BlockType::I64 => write_all!(self.cast_i64(), write_i64_into),
        }
    }

    fn cast_f32(&self) -> Vec<f32> {
        match self {
            BlockData::F32(v) => v.clone(),
            BlockData::F64(v) => v.iter().map(|&x| x as f32).collect(),
            BlockData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            BlockData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    fn cast_f64(&self) -> Vec<f64> {
        self.to_f64()
    }

    fn cast_i32(&self) -> Vec<i32> {
        match self {
            BlockData::F32(v) => v.iter().map(|&x| x as i32).collect(),
            BlockData::F64(v) => v.iter().map(|&x| x as i32).collect(),
            BlockData::I32(v) => v.clone(),
            BlockData::I64(v) => v.iter().map(|&x| x as i32).collect(),
        }
    }

    fn cast_i64(&self) -> Vec<i64> {
        match self {
            BlockData::F32(v) => v.iter().map(|&x| x as i64).collect(),
            BlockData::F64(v) => v.iter().map(|&x| x as i64).collect(),
            BlockData::I32(v) => v.iter().map(|&x| x as i64).collect(),
            BlockData::I64(v) => v.clone(),
        }
    }
}

/// One named block: where its payload lives and how to interpret it.
#[derive(Debug, Clone)]
pub struct GadgetBlock {
    /// Byte offset of the payload start.
    pub start: u64,
    /// Payload byte length (record markers excluded).
    pub length: u64,
    /// Bytes per particle.
    pub partlen: u64,
    /// Inferred element type.
    pub dtype: BlockType,
    /// Which of the six particle types have rows in this block.
    pub p_types: [bool; 6],
}

impl GadgetBlock {
    /// Columns per particle (3 for positions/velocities, 1 for scalars).
    pub fn dims(&self) -> u64 {
        self.partlen / self.dtype.size()
    }
}

/// The fixed-layout 256-byte snapshot header.
#[derive(Debug, Clone)]
pub struct GadgetHeader {
    /// Particle count per type in this file.
    pub npart: [u32; 6],
    /// Mass per particle type; zero means masses are stored in a block.
    pub mass: [f64; 6],
    pub time: f64,
    pub redshift: f64,
    pub flag_sfr: i32,
    pub flag_feedback: i32,
    /// Low 32 bits of the global per-type particle counts.
    pub npart_total: [u32; 6],
    pub flag_cooling: i32,
    /// Number of files making up this snapshot.
    pub num_files: i32,
    pub box_size: f64,
    pub omega0: f64,
    pub omega_lambda: f64,
    pub hubble_param: f64,
    pub flag_stellarage: i32,
    pub flag_metals: i32,
    /// High words of the global per-type particle counts.
    pub nall_hw: [u32; 6],
    pub flag_entropy_instead_u: i32,
    pub flag_doubleprecision: i32,
    pub flag_ic_info: i32,
    pub lpt_scaling_factor: f32,
    /// Reserved bytes. May contain vendor extensions; never rewritten.
    pub padding: [u8; HEADER_PAD],
    pub endian: Endian,
}

impl Default for GadgetHeader {
    fn default() -> Self {
        GadgetHeader {
            npart: [0; 6],
            mass: [0.0; 6],
            time: 0.0,
            redshift: 0.0,
            flag_sfr: 0,
            flag_feedback: 0,
            npart_total: [0; 6],
            flag_cooling: 0,
            num_files: 1,
            box_size: 0.0,
            omega0: 0.0,
            omega_lambda: 0.0,
            hubble_param: 0.0,
            flag_stellarage: 0,
            flag_metals: 0,
            nall_hw: [0; 6],
            flag_entropy_instead_u: 0,
            flag_doubleprecision: 0,
            flag_ic_info: 0,
            lpt_scaling_factor: 0.0,
            padding: [0; HEADER_PAD],
            endian: Endian::native(),
        }
    }
}

impl GadgetHeader {
    /// Decode a raw 256-byte HEAD payload.
    pub fn decode(data: &[u8; 256], endian: Endian) -> Self {
        let mut h = GadgetHeader {
            endian,
            ..Default::default()
        };
        for t in 0..6 {
            h.npart[t] = endian.read_u32(&data[t * 4..]);
            h.mass[t] = endian.read_f64(&data[24 + t * 8..]);
            h.npart_total[t] = endian.read_u32(&data[96 + t * 4..]);
            h.nall_hw[t] = endian.read_u32(&data[168 + t * 4..]);
        }
        h.time = endian.read_f64(&data[72..]);
        h.redshift = endian.read_f64(&data[80..]);
        h.flag_sfr = endian.read_i32(&data[88..]);
        h.flag_feedback = endian.read_i32(&data[92..]);
        h.flag_cooling = endian.read_i32(&data[120..]);
        h.num_files = endian.read_i32(&data[124..]);
        h.box_size = endian.read_f64(&data[128..]);
        h.omega0 = endian.read_f64(&data[136..]);
        h.omega_lambda = endian.read_f64(&data[144..]);
        h.hubble_param = endian.read_f64(&data[152..]);
        h.flag_stellarage = endian.read_i32(&data[160..]);
        h.flag_metals = endian.read_i32(&data[164..]);
        h.flag_entropy_instead_u = endian.read_i32(&data[192..]);
        h.flag_doubleprecision = endian.read_i32(&data[196..]);
        h.flag_ic_info = endian.read_i32(&data[200..]);
        h.lpt_scaling_factor = endian.read_f32(&data[204..]);
        h.padding.copy_from_slice(&data[208..256]);
        h
    }

    /// Serialize the first 208 bytes of the header record. The 48 reserved
    /// bytes are deliberately not included: on rewrite they are skipped so
    /// any extra data present in them survives.
    pub fn serialize(&self) -> [u8; 208] {
        let e = self.endian;
        let mut b = [0u8; 208];
        for t in 0..6 {
            e.write_u32(&mut b[t * 4..], self.npart[t]);
            e.write_f64(&mut b[24 + t * 8..], self.mass[t]);
            e.write_u32(&mut b[96 + t * 4..], self.npart_total[t]);
            e.write_u32(&mut b[168 + t * 4..], self.nall_hw[t]);
        }
        e.write_f64(&mut b[72..], self.time);
        e.write_f64(&mut b[80..], self.redshift);
        e.write_i32(&mut b[88..], self.flag_sfr);
        e.write_i32(&mut b[92..], self.flag_feedback);
        e.write_i32(&mut b[120..], self.flag_cooling);
        e.write_i32(&mut b[124..], self.num_files);
        e.write_f64(&mut b[128..], self.box_size);
        e.write_f64(&mut b[136..], self.omega0);
        e.write_f64(&mut b[144..], self.omega_lambda);
        e.write_f64(&mut b[152..], self.hubble_param);
        e.write_i32(&mut b[160..], self.flag_stellarage);
        e.write_i32(&mut b[164..], self.flag_metals);
        e.write_i32(&mut b[192..], self.flag_entropy_instead_u);
        e.write_i32(&mut b[196..], self.flag_doubleprecision);
        e.write_i32(&mut b[200..], self.flag_ic_info);
        e.write_f32(&mut b[204..], self.lpt_scaling_factor);
        b
    }

    /// Total particle count in this file.
    pub fn total_particles(&self) -> u64 {
        self.npart.iter().map(|&n| n as u64).sum()
    }

    /// Global particle count per type, reassembled from the 32-bit split.
    pub fn global_counts(&self) -> [u64; 6] {
        let mut out = [0u64; 6];
        for t in 0..6 {
            out[t] = self.npart_total[t] as u64 + ((self.nall_hw[t] as u64) << 32);
        }
        out
    }
}

/// One physical Gadget file: its header plus the block location table.
///
/// The table is built once by scanning the file from offset 0 to EOF and is
/// mutated only by explicit write operations that preserve its structure.
pub struct GadgetFile {
    path: PathBuf,
    pub header: GadgetHeader,
    blocks: HashMap<String, GadgetBlock>,
    pub endian: Endian,
    /// True for the self-describing format 2, false for legacy format 1.
    pub format2: bool,
}

impl GadgetFile {
    /// Open a file and build its block table.
    pub fn open(path: &Path, config: &GadgetConfig) -> Result<Self, GadgetError> {
        let file = File::open(path)?;
        let mut fd = BufReader::new(file);
        let (endian, format2) = Self::check_format(&mut fd)?;

        let mut gf = GadgetFile {
            path: path.to_path_buf(),
            header: GadgetHeader::default(),
            blocks: HashMap::new(),
            endian,
            format2,
        };

        // Legacy files carry no names; consume the configured list in order.
        let mut legacy_names: Vec<String> = if format2 {
            Vec::new()
        } else {
            config
                .legacy_block_names
                .iter()
                .map(|n| GadgetConfig::disk_name(n))
                .rev()
                .collect()
        };

        let mut t_part: u64 = 0;
        loop {
            let (name, length) = gf.read_block_head(&mut fd, &mut legacy_names)?;
            if length == 0 {
                break;
            }
            if name == "HEAD" {
                if length != HEADER_SIZE {
                    return Err(gf.corrupt("mis-sized HEAD block"));
                }
                let mut raw = [0u8; 256];
                fd.read_exact(&mut raw)
                    .map_err(|_| gf.corrupt("could not read HEAD block"))?;
                gf.header = GadgetHeader::decode(&raw, endian);
                let record_size = gf.read_block_foot(&mut fd)?;
                if record_size as u64 != HEADER_SIZE {
                    return Err(gf.corrupt("bad record size for HEAD"));
                }
                t_part = gf.header.total_particles();
                continue;
            }

            let (partlen, dtype) = infer_type(&name, length, t_part);
            let start = fd.stream_position()?;

            // If the record size would overflow a u32, the stored length
            // cannot be trusted; recompute it from the particle counts and
            // seek by that instead. The footer still holds (and is checked
            // against) the wrapped value.
            let extra_len = t_part * partlen;
            if extra_len >= 1 << 32 {
                fd.seek(SeekFrom::Current(extra_len as i64))?;
            } else {
                fd.seek(SeekFrom::Current(length as i64))?;
            }
            let record_size = gf.read_block_foot(&mut fd)?;
            if record_size as u64 != length {
                return Err(gf.corrupt(&format!("footer mismatch for block {}", name)));
            }
            let length = if extra_len >= 1 << 32 {
                extra_len
            } else {
                length
            };

            let p_types = infer_presence(&name, length, partlen, &gf.header.npart)?;
            gf.blocks.insert(
                name,
                GadgetBlock {
                    start,
                    length,
                    partlen,
                    dtype,
                    p_types,
                },
            );
        }
        Ok(gf)
    }

    fn corrupt(&self, reason: &str) -> GadgetError {
        GadgetError::CorruptBlock {
            file: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// Classify format and byte order from the first four raw bytes.
    fn check_format(fd: &mut BufReader<File>) -> Result<(Endian, bool), GadgetError> {
        let mut magic = [0u8; 4];
        fd.seek(SeekFrom::Start(0))?;
        fd.read_exact(&mut magic).map_err(GadgetError::Io)?;
        let r = Endian::native().read_u32(&magic);
        let out = match r {
            8 => (Endian::native(), true),
            134217728 => (Endian::swapped(), true),
            256 => (Endian::native(), false),
            65536 => (Endian::swapped(), false),
            other => return Err(GadgetError::Format(other)),
        };
        fd.seek(SeekFrom::Start(0))?;
        Ok(out)
    }

    /// Read one block header record; returns (name, payload length).
    /// A zero length signals EOF.
    fn read_block_head(
        &self,
        fd: &mut BufReader<File>,
        legacy_names: &mut Vec<String>,
    ) -> Result<(String, u64), GadgetError> {
        if self.format2 {
            let mut head = [0u8; 20];
            // Running out of file is not an error, just an empty block.
            if read_exact_or_eof(fd, &mut head)? < 20 {
                return Ok(("    ".to_string(), 0));
            }
            let e = self.endian;
            let marker0 = e.read_u32(&head[0..]);
            let name = String::from_utf8_lossy(&head[4..8]).into_owned();
            let next = e.read_u32(&head[8..]);
            let marker1 = e.read_u32(&head[12..]);
            let payload = e.read_u32(&head[16..]);
            if marker0 != 8 || marker1 != 8 || payload != next.wrapping_sub(8) {
                return Err(self.corrupt("corrupt header record, possibly wrong file format"));
            }
            // The two record-size markers are not part of the length.
            Ok((name, payload as u64))
        } else {
            let mut raw = [0u8; 4];
            if read_exact_or_eof(fd, &mut raw)? < 4 {
                return Ok(("    ".to_string(), 0));
            }
            let record_size = self.endian.read_u32(&raw);
            let name = legacy_names
                .pop()
                .ok_or_else(|| GadgetError::MissingBlockName {
                    file: self.path.clone(),
                })?;
            Ok((name, record_size as u64))
        }
    }

    fn read_block_foot(&self, fd: &mut BufReader<File>) -> Result<u32, GadgetError> {
        let mut raw = [0u8; 4];
        fd.read_exact(&mut raw)
            .map_err(|_| self.corrupt("could not read block footer"))?;
        Ok(self.endian.read_u32(&raw))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    pub fn block(&self, name: &str) -> Option<&GadgetBlock> {
        self.blocks.get(name)
    }

    pub fn block_names(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(|s| s.as_str())
    }

    /// Number of particles a block holds for one type (or all types).
    pub fn block_parts(&self, name: &str, p_type: Option<usize>) -> u64 {
        let Some(block) = self.blocks.get(name) else {
            return 0;
        };
        match p_type {
            None => block.length / block.partlen,
            Some(t) => {
                if block.p_types[t] {
                    self.header.npart[t] as u64
                } else {
                    0
                }
            }
        }
    }

    /// Particle rows to skip before type `p_type` starts within a block.
    pub fn start_part(&self, name: &str, p_type: Option<usize>) -> u64 {
        let (Some(t), Some(block)) = (p_type, self.blocks.get(name)) else {
            return 0;
        };
        (0..t)
            .filter(|&i| block.p_types[i])
            .map(|i| self.header.npart[i] as u64)
            .sum()
    }

    /// Columns per particle for a block (3 for POS/VEL, 1 for scalars).
    pub fn block_dims(&self, name: &str) -> u64 {
        self.blocks.get(name).map_or(0, |b| b.dims())
    }

    /// Read up to `max_parts` particles of one type (or all types) from a
    /// block. Returns the particle count actually read and the data,
    /// byte-swapped to native order.
    pub fn read_block(
        &self,
        name: &str,
        p_type: Option<usize>,
        max_parts: u64,
    ) -> Result<(u64, BlockData), GadgetError> {
        let block = self
            .blocks
            .get(name)
            .ok_or_else(|| GadgetError::MissingBlock(name.to_string()))?;
        let parts = self.block_parts(name, p_type).min(max_parts);
        let start = self.start_part(name, p_type);

        let mut fd = File::open(&self.path)?;
        fd.seek(SeekFrom::Start(block.start + block.partlen * start))?;
        let mut bytes = vec![0u8; (parts * block.partlen) as usize];
        fd.read_exact(&mut bytes)?;
        Ok((parts, BlockData::decode(&bytes, block.dtype, self.endian)))
    }

    /// Write particle data into a block for one type (or all types).
    ///
    /// The block header record is (re)written immediately before the data
    /// when the write covers the first present type, and the footer is
    /// written at the block end when it covers the last; partial per-type
    /// writes into a shared block never disturb neighbouring types' rows.
    pub fn write_block(
        &self,
        name: &str,
        p_type: Option<usize>,
        data: &BlockData,
    ) -> Result<(), GadgetError> {
        let block = self
            .blocks
            .get(name)
            .ok_or_else(|| GadgetError::MissingBlock(name.to_string()))?;
        let parts = self.block_parts(name, p_type);
        let start = self.start_part(name, p_type);
        let capacity = parts * block.dims();
        if data.len() as u64 > capacity {
            return Err(GadgetError::SizeMismatch {
                name: name.to_string(),
                capacity,
                requested: data.len() as u64,
            });
        }
        if data.dtype().is_float() != block.dtype.is_float() {
            return Err(GadgetError::TypeMismatch {
                name: name.to_string(),
                expected: block.dtype,
                given: data.dtype(),
            });
        }
        let min_type = block.p_types.iter().position(|&p| p);
        let max_type = block.p_types.iter().rposition(|&p| p);

        let mut fd = OpenOptions::new().read(true).write(true).open(&self.path)?;

        if p_type.is_none() || p_type == min_type {
            let head = self.block_header_bytes(name, block.length);
            fd.seek(SeekFrom::Start(block.start - head.len() as u64))?;
            fd.write_all(&head)?;
        }

        fd.seek(SeekFrom::Start(block.start + block.partlen * start))?;
        fd.write_all(&data.encode(block.dtype, self.endian))?;

        if p_type.is_none() || p_type == max_type {
            fd.seek(SeekFrom::Start(block.start + block.length))?;
            fd.write_all(&self.block_footer_bytes(block.length))?;
        }
        Ok(())
    }

    /// Register a new block immediately after the current last block,
    /// leaving a gap for its header and footer records. Writes nothing.
    pub fn add_block(
        &mut self,
        name: &str,
        length: u64,
        partlen: u64,
        dtype: BlockType,
        p_types: Option<[bool; 6]>,
    ) -> Result<(), GadgetError> {
        if self.blocks.contains_key(name) {
            return Err(GadgetError::BlockExists(name.to_string()));
        }
        let last = self
            .blocks
            .values()
            .max_by_key(|b| b.start)
            .ok_or_else(|| GadgetError::MissingBlock("HEAD".to_string()))?;
        // Gap: previous footer + the new block's header records.
        let gap = if self.format2 { 24 } else { 8 };
        let start = last.start + last.length + gap;
        self.blocks.insert(
            name.to_string(),
            GadgetBlock {
                start,
                length,
                partlen,
                dtype,
                p_types: p_types.unwrap_or([true; 6]),
            },
        );
        Ok(())
    }

    /// Write a header to this file. The per-type counts in `header` are
    /// overridden by this file's own counts so the on-disk header always
    /// reflects local contents, even when a shared global header is passed.
    pub fn write_header(&self, header: &GadgetHeader) -> Result<(), GadgetError> {
        let mut local = header.clone();
        local.npart = self.header.npart;
        local.endian = self.endian;

        let mut fd = OpenOptions::new().read(true).write(true).open(&self.path)?;
        fd.seek(SeekFrom::Start(0))?;
        fd.write_all(&self.block_header_bytes("HEAD", HEADER_SIZE))?;
        fd.write_all(&local.serialize())?;
        // Skip the reserved bytes rather than overwrite them.
        fd.seek(SeekFrom::Current(HEADER_PAD as i64))?;
        fd.write_all(&self.block_footer_bytes(HEADER_SIZE))?;
        Ok(())
    }

    /// The bytes preceding a block payload: the format 2 name record (when
    /// applicable) plus the opening record-size marker.
    fn block_header_bytes(&self, name: &str, length: u64) -> Vec<u8> {
        let e = self.endian;
        let mut out = Vec::with_capacity(20);
        if self.format2 {
            let mut rec = [0u8; 16];
            e.write_u32(&mut rec[0..], 8);
            rec[4..8].copy_from_slice(&name.as_bytes()[..4]);
            e.write_u32(&mut rec[8..], length as u32 + 8);
            e.write_u32(&mut rec[12..], 8);
            out.extend_from_slice(&rec);
        }
        out.extend_from_slice(&self.block_footer_bytes(length));
        out
    }

    fn block_footer_bytes(&self, length: u64) -> [u8; 4] {
        let mut out = [0u8; 4];
        self.endian.write_u32(&mut out, length as u32);
        out
    }
}

/// Element type heuristic. POS/VEL are 3-vectors (f64 iff the length works
/// out to 24 bytes per particle), IDs are integers (i32 iff 4 bytes per
/// particle), everything else is a scalar float (f64 iff 8 bytes per
/// particle). First match wins; there is no escape hatch for other widths.
fn infer_type(name: &str, length: u64, t_part: u64) -> (u64, BlockType) {
    match name {
        "POS " | "VEL " => {
            if length == t_part * 24 {
                (24, BlockType::F64)
            } else {
                (12, BlockType::F32)
            }
        }
        "ID  " => {
            if length == t_part * 4 {
                (4, BlockType::I32)
            } else {
                (8, BlockType::I64)
            }
        }
        _ => {
            if length == t_part * 8 {
                (8, BlockType::F64)
            } else {
                (4, BlockType::F32)
            }
        }
    }
}

/// Particle-type presence heuristic: find the subset of types whose counts
/// sum to exactly the observed block length, trying subsets in increasing
/// size order (all six first as the trivial case, then 1, 2, 3, all-but-2,
/// all-but-1). Assumes a type's rows are either fully present or absent.
fn infer_presence(
    name: &str,
    length: u64,
    partlen: u64,
    npart: &[u32; 6],
) -> Result<[bool; 6], GadgetError> {
    let n: Vec<u64> = npart.iter().map(|&x| x as u64).collect();
    let total: u64 = n.iter().sum();

    if length == total * partlen {
        return Ok([true; 6]);
    }
    for a in 0..N_TYPE {
        if length == n[a] * partlen {
            let mut p = [false; 6];
            p[a] = true;
            return Ok(p);
        }
    }
    for a in 0..N_TYPE {
        for b in 0..N_TYPE {
            if length == (n[a] + n[b]) * partlen {
                let mut p = [false; 6];
                p[a] = true;
                p[b] = true;
                return Ok(p);
            }
        }
    }
    for a in 0..N_TYPE {
        for b in 0..N_TYPE {
            for c in 0..N_TYPE {
                if length == (n[a] + n[b] + n[c]) * partlen {
                    let mut p = [false; 6];
                    p[a] = true;
                    p[b] = true;
                    p[c] = true;
                    return Ok(p);
                }
            }
        }
    }
    for a in 0..N_TYPE {
        for b in 0..N_TYPE {
            if n[a] + n[b] <= total && length == (total - n[a] - n[b]) * partlen {
                let mut p = [true; 6];
                p[a] = false;
                p[b] = false;
                return Ok(p);
            }
        }
    }
    for a in 0..N_TYPE {
        if length == (total - n[a]) * partlen {
            let mut p = [true; 6];
            p[a] = false;
            return Ok(p);
        }
    }
    Err(GadgetError::AmbiguousPresence {
        name: name.to_string(),
        length,
    })
}

/// Like `read_exact` but reports a clean EOF (or short read) as the byte
/// count instead of an error.
fn read_exact_or_eof(fd: &mut BufReader<File>, buf: &mut [u8]) -> Result<usize, GadgetError> {
    let mut total = 0;
    while total < buf.len() {
        let n = fd.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
