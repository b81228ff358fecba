use adler32::RollingAdler32;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read, Write};

use crate::{ErrorKind, Result};

/// エントリファイルの先頭に書き込まれるマジックナンバー.
pub const ENTRY_MAGIC_NUMBER: [u8; 4] = *b"jioe";

/// エントリファイルのフォーマットのバージョン.
pub const ENTRY_VERSION: u16 = 1;

pub const MAGIC_SIZE: usize = 4;
pub const VERSION_SIZE: usize = 2;
pub const STATE_SIZE: usize = 1;
pub const SEQUENCE_SIZE: usize = 8;
pub const LENGTH_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;
pub const OP_HEADER_SIZE: usize = 8 + 4;
pub const TRUNCATE_FLAG_SIZE: usize = 1;
pub const TRUNCATE_SIZE: usize = 8;

/// 状態を表すバイトの位置.
///
/// 状態はチェックサムの対象外であり、この位置のバイトのみを上書きすることで遷移させる.
pub const STATE_OFFSET: u64 = (MAGIC_SIZE + VERSION_SIZE) as u64;

/// ボディの前に位置するフレームのサイズ.
pub const FRAME_HEADER_SIZE: usize =
    MAGIC_SIZE + VERSION_SIZE + STATE_SIZE + SEQUENCE_SIZE + LENGTH_SIZE;

/// ジャーナルエントリのシーケンス番号.
///
/// ジャーナルストア内で単調増加かつ一意であり、復旧時にはこの順番でエントリが再適用される.
pub type SequenceId = u64;

/// ジャーナルエントリの永続化された状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// 追記直後の状態.
    ///
    /// ジャーナル上では完全だが、対象ファイルへの適用が完了したかどうかは不明.
    InProgress,

    /// 対象ファイルへの適用と同期が完了し、`linger`指定により保持されている.
    Committed,

    /// 適用が完了しており、回収可能.
    Applied,

    /// 取り消されており、回収可能.
    RolledBack,
}
impl EntryState {
    /// 状態を一バイトの値に変換する.
    pub fn as_u8(self) -> u8 {
        match self {
            EntryState::InProgress => 0,
            EntryState::Committed => 1,
            EntryState::Applied => 2,
            EntryState::RolledBack => 3,
        }
    }

    /// 一バイトの値から状態を復元する.
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(EntryState::InProgress),
            1 => Some(EntryState::Committed),
            2 => Some(EntryState::Applied),
            3 => Some(EntryState::RolledBack),
            _ => None,
        }
    }

    /// 対象ファイルとの関係が確定しており、回収して良い状態かどうかを判定する.
    pub fn is_resolved(self) -> bool {
        match self {
            EntryState::InProgress | EntryState::Committed => false,
            EntryState::Applied | EntryState::RolledBack => true,
        }
    }

    /// `self`から`next`への遷移が許されているかどうかを判定する.
    ///
    /// 同じ状態への遷移は常に許される(何も行われない).
    pub fn can_transit_to(self, next: EntryState) -> bool {
        use self::EntryState::*;
        match (self, next) {
            (InProgress, _) => true,
            (Committed, InProgress) => false,
            (Committed, _) => true,
            (Applied, Applied) | (RolledBack, RolledBack) => true,
            (Applied, _) | (RolledBack, _) => false,
        }
    }
}

/// トランザクションに含まれる一つの書き込み操作.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    /// 書き込み先のオフセット.
    pub offset: u64,

    /// 書き込むデータ.
    pub data: Vec<u8>,
}
impl WriteOp {
    /// 新しい`WriteOp`インスタンスを生成する.
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        WriteOp { offset, data }
    }

    /// 書き込み範囲の終端(排他的)を返す.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// `[offset..offset+len)`と書き込み範囲が重なっているかどうかを判定する.
    pub fn overlaps(&self, offset: u64, len: u64) -> bool {
        !self.data.is_empty() && len != 0 && self.offset < offset + len && offset < self.end()
    }
}

/// ジャーナルに記録されるエントリ.
///
/// 一つのトランザクションの書き込み操作群に対応する.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry<T = Vec<WriteOp>> {
    /// シーケンス番号.
    pub seq: SequenceId,

    /// 状態.
    pub state: EntryState,

    /// 発行順に並んだ書き込み操作群.
    pub ops: T,

    /// 書き込み操作群の適用後に、ファイルをこのサイズまで切り詰める.
    ///
    /// ファイルがこれより短い場合には何も行わない.
    pub truncate_to: Option<u64>,
}
impl<T: AsRef<[WriteOp]>> JournalEntry<T> {
    /// 読み書き時のサイズ(バイト数)を返す.
    pub(crate) fn external_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_size() + CHECKSUM_SIZE
    }

    /// 書き込み操作群が書き込むデータのバイト数の合計を返す.
    pub fn payload_size(&self) -> u64 {
        self.ops.as_ref().iter().map(|op| op.data.len() as u64).sum()
    }

    /// `writer`にエントリを書き込む.
    pub(crate) fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let body_size = self.body_size();
        track_assert!(
            body_size <= u32::max_value() as usize,
            ErrorKind::InvalidInput,
            "Too large journal entry: body_size={}",
            body_size
        );

        let mut body = Vec::with_capacity(body_size);
        track_io!(body.write_u32::<BigEndian>(self.ops.as_ref().len() as u32))?;
        for op in self.ops.as_ref() {
            track_assert!(
                op.data.len() <= u32::max_value() as usize,
                ErrorKind::InvalidInput
            );
            track_io!(body.write_u64::<BigEndian>(op.offset))?;
            track_io!(body.write_u32::<BigEndian>(op.data.len() as u32))?;
            track_io!(body.write_all(&op.data))?;
        }
        if let Some(size) = self.truncate_to {
            track_io!(body.write_u8(1))?;
            track_io!(body.write_u64::<BigEndian>(size))?;
        } else {
            track_io!(body.write_u8(0))?;
        }

        track_io!(writer.write_all(&ENTRY_MAGIC_NUMBER))?;
        track_io!(writer.write_u16::<BigEndian>(ENTRY_VERSION))?;
        track_io!(writer.write_u8(self.state.as_u8()))?;
        track_io!(writer.write_u64::<BigEndian>(self.seq))?;
        track_io!(writer.write_u32::<BigEndian>(body.len() as u32))?;
        track_io!(writer.write_all(&body))?;
        track_io!(writer.write_u32::<BigEndian>(checksum(self.seq, &body)))?;
        Ok(())
    }

    fn body_size(&self) -> usize {
        LENGTH_SIZE
            + self
                .ops
                .as_ref()
                .iter()
                .map(|op| OP_HEADER_SIZE + op.data.len())
                .sum::<usize>()
            + TRUNCATE_FLAG_SIZE
            + self.truncate_to.map_or(0, |_| TRUNCATE_SIZE)
    }
}
impl JournalEntry<Vec<WriteOp>> {
    /// エントリファイルの内容全体を復号する.
    ///
    /// 復号できなかった場合には、その理由を分類した`EntryDefect`が返される.
    pub fn decode(bytes: &[u8]) -> ::std::result::Result<Self, EntryDefect> {
        if bytes.len() >= MAGIC_SIZE && bytes[..MAGIC_SIZE] != ENTRY_MAGIC_NUMBER {
            return Err(EntryDefect::Malformed("unknown magic number"));
        }
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(EntryDefect::Truncated {
                expected: FRAME_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let mut offset = MAGIC_SIZE;
        let version = BigEndian::read_u16(&bytes[offset..]);
        offset += VERSION_SIZE;
        if version != ENTRY_VERSION {
            return Err(EntryDefect::Malformed("unsupported version"));
        }
        let state = EntryState::from_u8(bytes[offset]);
        offset += STATE_SIZE;
        let seq = BigEndian::read_u64(&bytes[offset..]);
        offset += SEQUENCE_SIZE;
        let body_len = BigEndian::read_u32(&bytes[offset..]) as usize;
        offset += LENGTH_SIZE;

        let expected = (offset + body_len + CHECKSUM_SIZE) as u64;
        let actual = bytes.len() as u64;
        if actual < expected {
            return Err(EntryDefect::Truncated { expected, actual });
        }
        if actual > expected {
            return Err(EntryDefect::Malformed("trailing bytes"));
        }

        let body = &bytes[offset..offset + body_len];
        let stored = BigEndian::read_u32(&bytes[offset + body_len..]);
        let computed = checksum(seq, body);
        if stored != computed {
            return Err(EntryDefect::ChecksumMismatch { stored, computed });
        }

        let state = state.ok_or(EntryDefect::Malformed("unknown state"))?;
        let (ops, truncate_to) = read_body(body)?;
        Ok(JournalEntry {
            seq,
            state,
            ops,
            truncate_to,
        })
    }
}

/// 復号できなかったエントリの分類.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDefect {
    /// フレームが宣言するサイズよりもファイルが短い(i.e., 追記中にクラッシュした).
    Truncated {
        /// フレームから期待されるサイズ.
        expected: u64,

        /// 実際のサイズ.
        actual: u64,
    },

    /// チェックサムが一致しない.
    ChecksumMismatch {
        /// 記録されていたチェックサム.
        stored: u32,

        /// 内容から計算したチェックサム.
        computed: u32,
    },

    /// チェックサム以外の構造上の不整合.
    Malformed(&'static str),
}
impl fmt::Display for EntryDefect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            EntryDefect::Truncated { expected, actual } => {
                write!(f, "truncated (expected={}, actual={})", expected, actual)
            }
            EntryDefect::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum mismatch (stored={:08x}, computed={:08x})",
                stored, computed
            ),
            EntryDefect::Malformed(reason) => write!(f, "malformed ({})", reason),
        }
    }
}
impl ::std::error::Error for EntryDefect {}

fn read_body(body: &[u8]) -> ::std::result::Result<(Vec<WriteOp>, Option<u64>), EntryDefect> {
    let malformed = |_| EntryDefect::Malformed("inconsistent body");
    let mut reader = Cursor::new(body);
    let count = reader.read_u32::<BigEndian>().map_err(malformed)?;
    let mut ops = Vec::new();
    for _ in 0..count {
        let offset = reader.read_u64::<BigEndian>().map_err(malformed)?;
        let len = reader.read_u32::<BigEndian>().map_err(malformed)?;
        if offset.checked_add(u64::from(len)).is_none() {
            return Err(EntryDefect::Malformed("offset overflow"));
        }
        let remaining = body.len() as u64 - reader.position();
        if remaining < u64::from(len) {
            return Err(EntryDefect::Malformed("inconsistent body"));
        }
        let mut data = vec![0; len as usize];
        reader.read_exact(&mut data).map_err(malformed)?;
        ops.push(WriteOp { offset, data });
    }
    let truncate_to = match reader.read_u8().map_err(malformed)? {
        0 => None,
        1 => Some(reader.read_u64::<BigEndian>().map_err(malformed)?),
        _ => return Err(EntryDefect::Malformed("unknown truncation flag")),
    };
    if reader.position() != body.len() as u64 {
        return Err(EntryDefect::Malformed("inconsistent body"));
    }
    Ok((ops, truncate_to))
}

fn checksum(seq: SequenceId, body: &[u8]) -> u32 {
    let mut adler32 = RollingAdler32::new();
    let mut buf = [0; SEQUENCE_SIZE + LENGTH_SIZE];
    BigEndian::write_u64(&mut buf, seq);
    BigEndian::write_u32(&mut buf[SEQUENCE_SIZE..], body.len() as u32);
    adler32.update_buffer(&buf);
    adler32.update_buffer(body);
    adler32.hash()
}
