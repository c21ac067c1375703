use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::{FieldValue, Id, IndexEntry};
use crate::error::{Error, Result};

const LOG_MAGIC: u32 = 0x3158_4449; // "IDX1"
const LOG_VERSION: u32 = 1;
pub(crate) const HEADER_LEN: u64 = 8;

const KIND_PUT: u8 = 1;
const KIND_TOMBSTONE: u8 = 2;

// kind + id + value_len
const PAYLOAD_FIXED: usize = 1 + 8 + 4;
// 单帧上限：防止损坏的 len 触发超大分配；写入端同样受此约束
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// 能写进一帧的字段值最大字节数。
pub const MAX_VALUE_LEN: usize = MAX_FRAME_LEN as usize - PAYLOAD_FIXED;

/// 回放出的一条记录及其在文件中的字节偏移。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedEntry {
    pub offset: u64,
    pub entry: IndexEntry,
}

/// 单字段的 append-only 索引日志。
///
/// 布局：`magic u32 | version u32`，之后每帧 `len u32 | crc32 u32 | payload`，
/// payload = `kind u8 | id i64 | value_len u32 | value`（全部 LE）。
/// 流以 EOF 结束，没有哨兵帧。
pub struct IndexLog {
    field: String,
    path: PathBuf,
    file: Mutex<File>,
    sync: bool,
}

impl IndexLog {
    /// 新建（已存在则截断）并写 header。
    pub fn create(path: impl Into<PathBuf>, field: &str, sync: bool) -> Result<Self> {
        let path = path.into();
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        write_header(&mut f)?;
        if sync {
            f.sync_all()?;
        }
        drop(f);
        Self::open(path, field, sync)
    }

    /// 打开已有日志用于追加；header 在 replay 时校验。
    pub fn open(path: impl Into<PathBuf>, field: &str, sync: bool) -> Result<Self> {
        let path = path.into();
        let mut f = OpenOptions::new().read(true).append(true).open(&path)?;
        if f.metadata()?.len() == 0 {
            // 建文件后、写 header 前崩溃留下的空文件
            write_header(&mut f)?;
        }
        Ok(Self {
            field: field.to_string(),
            path,
            file: Mutex::new(f),
            sync,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// 追加一条记录，返回它的起始偏移。
    pub fn append(&self, entry: &IndexEntry) -> Result<u64> {
        let frame = encode_frame(&self.field, entry)?;
        self.append_bytes(&frame)
    }

    /// 批量追加：整批编码后一次写入；任何一条编码失败则整批不写。
    pub fn append_all(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for e in entries {
            buf.extend_from_slice(&encode_frame(&self.field, e)?);
        }
        self.append_bytes(&buf).map(|_| ())
    }

    fn append_bytes(&self, buf: &[u8]) -> Result<u64> {
        let mut f = self.file.lock();
        let offset = append_frames(&mut *f, buf).map_err(|e| {
            tracing::warn!("Append to index log {:?} failed: {}", self.path, e);
            e
        })?;
        if self.sync {
            f.sync_data()?;
        }
        Ok(offset)
    }

    /// 从头顺序回放（惰性）。使用独立的读句柄，不影响追加位置。
    pub fn replay(&self) -> Result<LogReplay> {
        LogReplay::open(&self.path, &self.field)
    }

    /// 删除整个日志文件（RemoveIndex 用）。
    pub fn delete_field_log(self) -> Result<()> {
        let IndexLog { path, file, .. } = self;
        drop(file);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

/// 顺序回放迭代器；遇到损坏帧产出一次 `CorruptIndex` 后结束。
pub struct LogReplay {
    reader: BufReader<File>,
    field: String,
    offset: u64,
    done: bool,
}

impl LogReplay {
    fn open(path: &Path, field: &str) -> Result<Self> {
        let f = File::open(path)?;
        let len = f.metadata()?.len();
        let mut replay = Self {
            reader: BufReader::new(f),
            field: field.to_string(),
            offset: 0,
            done: len == 0,
        };
        if replay.done {
            return Ok(replay);
        }

        let mut hdr = [0u8; HEADER_LEN as usize];
        if read_full(&mut replay.reader, &mut hdr)? != hdr.len() {
            return Err(replay.corrupt("truncated header"));
        }
        let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let ver = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        if magic != LOG_MAGIC {
            return Err(replay.corrupt("bad magic"));
        }
        if ver != LOG_VERSION {
            return Err(replay.corrupt("unsupported version"));
        }
        replay.offset = HEADER_LEN;
        Ok(replay)
    }

    fn corrupt(&self, reason: &'static str) -> Error {
        Error::CorruptIndex {
            field: self.field.clone(),
            offset: self.offset,
            reason,
        }
    }

    fn next_frame(&mut self) -> Result<Option<LoggedEntry>> {
        let mut lb = [0u8; 8];
        match read_full(&mut self.reader, &mut lb)? {
            0 => return Ok(None),
            8 => {}
            _ => return Err(self.corrupt("truncated frame header")),
        }
        let len = u32::from_le_bytes([lb[0], lb[1], lb[2], lb[3]]);
        let crc = u32::from_le_bytes([lb[4], lb[5], lb[6], lb[7]]);
        if len > MAX_FRAME_LEN || (len as usize) < PAYLOAD_FIXED {
            return Err(self.corrupt("frame length out of range"));
        }

        let mut buf = vec![0u8; len as usize];
        if read_full(&mut self.reader, &mut buf)? != buf.len() {
            return Err(self.corrupt("truncated frame"));
        }
        if crc32fast::hash(&buf) != crc {
            return Err(self.corrupt("checksum mismatch"));
        }
        let entry = decode_payload(&buf).ok_or_else(|| self.corrupt("malformed entry"))?;

        let offset = self.offset;
        self.offset += 8 + len as u64;
        Ok(Some(LoggedEntry { offset, entry }))
    }
}

impl Iterator for LogReplay {
    type Item = Result<LoggedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(e)) => Some(Ok(e)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub(crate) fn write_header<W: Write>(w: &mut W) -> std::io::Result<()> {
    w.write_all(&LOG_MAGIC.to_le_bytes())?;
    w.write_all(&LOG_VERSION.to_le_bytes())?;
    w.flush()
}

/// 追加目标：可查询当前长度、可截断。
pub(crate) trait FrameSink: Write {
    fn size(&self) -> std::io::Result<u64>;
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl FrameSink for File {
    fn size(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

/// 写入整段帧并返回起始偏移。写失败时截断回写入前的长度，文件尾不留半帧。
pub(crate) fn append_frames<W: FrameSink + ?Sized>(f: &mut W, buf: &[u8]) -> Result<u64> {
    let offset = f.size()?;
    if let Err(e) = f.write_all(buf).and_then(|_| f.flush()) {
        if let Err(te) = f.truncate(offset) {
            tracing::warn!("Truncating index log back to {} failed: {}", offset, te);
        }
        return Err(e.into());
    }
    Ok(offset)
}

/// 编码一帧；值超过 [`MAX_VALUE_LEN`] 时拒绝（回放端不接受超限帧）。
pub(crate) fn encode_frame(field: &str, entry: &IndexEntry) -> Result<Vec<u8>> {
    let value = entry.value.as_bytes();
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::index_op(
            field,
            format!(
                "value of {} bytes exceeds the {} byte index limit",
                value.len(),
                MAX_VALUE_LEN
            ),
        ));
    }
    let mut payload = Vec::with_capacity(PAYLOAD_FIXED + value.len());
    payload.push(if entry.deleted { KIND_TOMBSTONE } else { KIND_PUT });
    payload.extend_from_slice(&entry.id.0.to_le_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.extend_from_slice(value);

    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_payload(buf: &[u8]) -> Option<IndexEntry> {
    let deleted = match *buf.first()? {
        KIND_PUT => false,
        KIND_TOMBSTONE => true,
        _ => return None,
    };
    let id = i64::from_le_bytes(buf.get(1..9)?.try_into().ok()?);
    let vlen = u32::from_le_bytes(buf.get(9..13)?.try_into().ok()?) as usize;
    let value = buf.get(13..13 + vlen)?;
    if 13 + vlen != buf.len() {
        return None;
    }
    Some(IndexEntry {
        value: FieldValue::from_bytes(value.to_vec()),
        id: Id(id),
        deleted,
    })
}

/// 读满 buf 或到 EOF，返回实际读到的字节数。
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}
