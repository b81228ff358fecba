use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use uuid::Uuid;

use super::{sync_dir, HEADER_FILE_NAME};
use crate::{ErrorKind, Result};

/// ジャーナルヘッダの先頭に書き込まれるマジックナンバー.
pub const MAGIC_NUMBER: [u8; 4] = *b"jioh";

/// ジャーナルフォーマットのメジャーバージョン.
pub const MAJOR_VERSION: u16 = 1;

/// ジャーナルフォーマットのマイナーバージョン.
pub const MINOR_VERSION: u16 = 0;

/// ヘッダを表現するのに必要なバイト数.
const HEADER_SIZE: u16 =
    2 /* major_version */ +
    2 /* minor_version */ +
    16 /* UUID */ +
    8 /* next_sequence */;

const TMP_HEADER_FILE_NAME: &str = "header.tmp";

/// ジャーナルディレクトリのヘッダ情報.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    /// メジャーバージョン.
    ///
    /// メジャーバージョンが異なるジャーナル同士のデータ形式には互換性が無い.
    pub major_version: u16,

    /// マイナーバージョン.
    ///
    /// マイナーバージョンには、後方互換性がある.
    pub minor_version: u16,

    /// ジャーナルの特定のインスタンスを識別するためのUUID.
    pub instance_uuid: Uuid,

    /// 次に割り当てられるシーケンス番号.
    ///
    /// エントリが全て回収された後に開き直しても番号が巻き戻らないように永続化される.
    pub next_sequence: u64,
}
impl JournalHeader {
    /// 新しいジャーナル用のヘッダを生成する.
    pub fn new() -> Self {
        JournalHeader {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            instance_uuid: Uuid::new_v4(),
            next_sequence: 1,
        }
    }

    /// ヘッダ情報を`reader`から読み込む.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        // magic number
        let mut magic_number = [0; 4];
        track_io!(reader.read_exact(&mut magic_number))?;
        track_assert_eq!(magic_number, MAGIC_NUMBER, ErrorKind::StorageCorrupted);

        // header size
        let header_size = track_io!(reader.read_u16::<BigEndian>())?;
        track_assert!(
            header_size >= HEADER_SIZE,
            ErrorKind::StorageCorrupted,
            "header_size:{}",
            header_size
        );
        let mut reader = reader.take(u64::from(header_size));

        // versions
        let major_version = track_io!(reader.read_u16::<BigEndian>())?;
        let minor_version = track_io!(reader.read_u16::<BigEndian>())?;
        track_assert_eq!(
            major_version,
            MAJOR_VERSION,
            ErrorKind::InvalidInput,
            "Unsupported major version",
        );
        track_assert!(
            minor_version <= MINOR_VERSION,
            ErrorKind::InvalidInput,
            "Unsupported minor version: actual={}, supported={}",
            minor_version,
            MINOR_VERSION
        );

        // UUID
        let mut instance_uuid = [0; 16];
        track_io!(reader.read_exact(&mut instance_uuid))?;
        let instance_uuid = Uuid::from_bytes(instance_uuid);

        let next_sequence = track_io!(reader.read_u64::<BigEndian>())?;
        track_assert_eq!(reader.limit(), 0, ErrorKind::StorageCorrupted);
        Ok(JournalHeader {
            major_version,
            minor_version,
            instance_uuid,
            next_sequence,
        })
    }

    /// ヘッダ情報を`writer`に書き込む.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        track_io!(writer.write_all(&MAGIC_NUMBER[..]))?;
        track_io!(writer.write_u16::<BigEndian>(HEADER_SIZE))?;
        track_io!(writer.write_u16::<BigEndian>(self.major_version))?;
        track_io!(writer.write_u16::<BigEndian>(self.minor_version))?;
        track_io!(writer.write_all(self.instance_uuid.as_bytes()))?;
        track_io!(writer.write_u64::<BigEndian>(self.next_sequence))?;
        Ok(())
    }

    /// ジャーナルディレクトリからヘッダを読み込む.
    ///
    /// ヘッダファイルが存在しない場合には`Ok(None)`が返される.
    pub(crate) fn read_from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(HEADER_FILE_NAME);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == ::std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return track!(track_io!(Err(e)), "path={:?}", path),
        };
        let header = track!(Self::read_from(file), "path={:?}", path)?;
        Ok(Some(header))
    }

    /// ジャーナルディレクトリにヘッダを書き込む.
    ///
    /// 一時ファイルに書き込んでから`rename(2)`で置き換えるので、
    /// 途中でクラッシュしても古いヘッダか新しいヘッダのいずれかが残る.
    pub(crate) fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let tmp_path = dir.join(TMP_HEADER_FILE_NAME);
        let mut file = track_io!(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path))?;
        let mut buf = Vec::new();
        track!(self.write_to(&mut buf))?;
        track_io!(file.write_all(&buf))?;
        track_io!(file.sync_all())?;
        track_io!(fs::rename(&tmp_path, dir.join(HEADER_FILE_NAME)))?;
        track!(sync_dir(dir))?;
        Ok(())
    }
}
impl Default for JournalHeader {
    fn default() -> Self {
        Self::new()
    }
}
