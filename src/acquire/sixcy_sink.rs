//! `Sink` implementation grounded directly on the container format's
//! `SixCyWriter`/`Superblock`/`block` primitives.
//!
//! Pages are written as `BlockType::Data` blocks under the shared
//! `FILE_ID_SHARED` id, addressed by absolute source offset
//! (`file_offset`) rather than by sequential chunk index — unlike
//! `SixCyWriter::add_file`, which assumes one file's chunks arrive in
//! order, the acquisition read loop writes pages out of order (reverse
//! direction) and with gaps (skipped defect regions), so this sink keeps
//! its own offset-addressed page index instead of a `FileIndexRecord`.
//!
//! A small fixed-size "prime header" is written eagerly right after the
//! superblock, patched in place on every geometry change, so a
//! recover-scan pass against an interrupted (never-finalized) archive can
//! still recover sector/page size and the declared source size.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

use crate::block::{BlockHeader, BlockType, BLOCK_HEADER_VERSION, FILE_ID_SHARED, FLAG_ENCRYPTED};
use crate::codec::{get_codec, CodecId};
use crate::superblock::{Superblock, SUPERBLOCK_SIZE};

use super::sink::{NullCallback, Phase, Sink, SinkCallback};

pub const PRIME_MAGIC: u32 = 0x504D_5231; // "PMR1"
pub const PRIME_HEADER_SIZE: usize = 64;
const PAGE_DATA_START: usize = SUPERBLOCK_SIZE + PRIME_HEADER_SIZE;
/// Fill byte for bad-sector markers, both the ones `bad_flag` writes and
/// the ones the read loop pre-fills its buffers with.
const BAD_SECTOR_FILL: u8 = 0;

#[derive(Debug, Clone, Copy, Default)]
struct PrimeHeader {
    sector_size: u32,
    page_size: u32,
    max_size: u64,
    declared_size: u64,
}

impl PrimeHeader {
    fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        let mut buf = [0u8; PRIME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&PRIME_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sector_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.max_size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.declared_size.to_le_bytes());
        let mut h = Crc32::new();
        h.update(&buf[..28]);
        buf[28..32].copy_from_slice(&h.finalize().to_le_bytes());
        w.write_all(&buf)
    }

    fn read<R: Read>(mut r: R) -> io::Result<Self> {
        let mut buf = [0u8; PRIME_HEADER_SIZE];
        r.read_exact(&mut buf)?;
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != PRIME_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "missing prime header"));
        }
        let mut h = Crc32::new();
        h.update(&buf[..28]);
        let expected = h.finalize();
        let stored = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        if expected != stored {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "prime header CRC32 mismatch"));
        }
        Ok(Self {
            sector_size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            page_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            max_size: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            declared_size: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageEntry {
    file_offset: u64,
    archive_offset: u64,
    orig_size: u64,
    comp_size: u64,
    content_hash: [u8; 32],
    /// Defect flag set via `bad_flag`; the page still occupies its offset
    /// range (zero-filled) but is marked unreliable.
    bad: bool,
}

/// JSON sidecar structure written as the archive's INDEX block payload,
/// replacing the teacher's name-oriented `FileIndex` with an
/// offset-oriented page table plus the flat segment namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PageIndex {
    pages: Vec<PageEntry>,
    segments: HashMap<String, Vec<u8>>,
}

pub struct SixcySink<W: Write + Seek> {
    writer: W,
    superblock: Superblock,
    prime: PrimeHeader,
    codec: CodecId,
    level: i32,
    encryption_key: Option<[u8; 32]>,
    callback: Box<dyn SinkCallback>,
    cur_offset: u64,
    page_counter: u64,
    index: PageIndex,
    dedup: HashMap<[u8; 32], (u64, u64, u64)>,
}

impl<W: Write + Seek> SixcySink<W> {
    pub fn new(mut writer: W) -> io::Result<Self> {
        let superblock = Superblock::new();
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&[0u8; PAGE_DATA_START])?;
        let sink = Self {
            writer,
            superblock,
            prime: PrimeHeader::default(),
            codec: CodecId::None,
            level: 0,
            encryption_key: None,
            callback: Box::new(NullCallback),
            cur_offset: 0,
            page_counter: 0,
            index: PageIndex::default(),
            dedup: HashMap::new(),
        };
        Ok(sink)
    }

    pub fn set_encryption_key(&mut self, key: [u8; 32]) {
        self.encryption_key = Some(key);
    }

    /// Geometry recovered from the prime header — sector size, page size,
    /// max size, and declared source size, in that order.
    pub fn prime_geometry(&self) -> (u32, u32, u64, u64) {
        (self.prime.sector_size, self.prime.page_size, self.prime.max_size, self.prime.declared_size)
    }

    /// Patch the prime header in place so a never-finalized archive can
    /// still be read for geometry by recover-scan.
    fn rewrite_prime_header(&mut self) -> io::Result<()> {
        let pos = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(SUPERBLOCK_SIZE as u64))?;
        self.prime.write(&mut self.writer)?;
        self.writer.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn write_page(&mut self, data: &[u8]) -> io::Result<()> {
        let file_offset = self.cur_offset;
        let content_hash: [u8; 32] = blake3::hash(data).into();

        if let Some(&(archive_offset, orig_size, comp_size)) = self.dedup.get(&content_hash) {
            self.index.pages.push(PageEntry {
                file_offset,
                archive_offset,
                orig_size,
                comp_size,
                content_hash,
                bad: false,
            });
            self.cur_offset += data.len() as u64;
            return Ok(());
        }

        self.callback.on_phase(self.page_counter, Phase::CompressionStart);
        let codec = get_codec(self.codec).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut payload = codec
            .compress(data, self.level)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let mut flags = 0u16;
        if let Some(key) = &self.encryption_key {
            payload = crate::crypto::encrypt(key, &payload)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            flags |= FLAG_ENCRYPTED;
        }
        self.callback.on_phase(self.page_counter, Phase::CompressionEnd);

        let header = BlockHeader {
            header_version: BLOCK_HEADER_VERSION,
            block_type: BlockType::Data,
            flags,
            codec_uuid: self.codec.uuid(),
            file_id: FILE_ID_SHARED,
            file_offset,
            orig_size: data.len() as u32,
            comp_size: payload.len() as u32,
            content_hash,
        };

        self.callback.on_phase(self.page_counter, Phase::WriteStart);
        let archive_offset = self.writer.stream_position()?;
        header.write(&mut self.writer)?;
        self.writer.write_all(&payload)?;
        self.callback.on_phase(self.page_counter, Phase::WriteEnd);

        self.superblock.add_required_codec(self.codec);
        self.dedup.insert(
            content_hash,
            (archive_offset, data.len() as u64, payload.len() as u64),
        );
        self.index.pages.push(PageEntry {
            file_offset,
            archive_offset,
            orig_size: data.len() as u64,
            comp_size: payload.len() as u64,
            content_hash,
            bad: false,
        });

        self.cur_offset += data.len() as u64;
        self.page_counter += 1;
        Ok(())
    }
}

impl<W: Read + Write + Seek> SixcySink<W> {
    /// Reopen a previously-created (possibly never-finalized) archive for
    /// Recover-Scan (G). Rebuilds the page table the same way
    /// [`SixcySource::scan_pages`] does — by walking block headers forward
    /// from `PAGE_DATA_START` rather than trusting the INDEX block, since
    /// an interrupted run never wrote one. If a prior run *did* finalize
    /// (the archive carries a valid superblock + INDEX), the existing
    /// segment table is recovered too so a second recover-scan pass
    /// doesn't lose case metadata or prior digests.
    pub fn open_existing(mut rw: W) -> io::Result<Self> {
        rw.seek(SeekFrom::Start(SUPERBLOCK_SIZE as u64))?;
        let prime = PrimeHeader::read(&mut rw)?;

        let mut index = PageIndex::default();
        let superblock = {
            rw.seek(SeekFrom::Start(0))?;
            match Superblock::read(&mut rw) {
                Ok(sb) if sb.index_offset > 0 => {
                    if let Ok(recovered) = Self::read_index_block(&mut rw, sb.index_offset) {
                        index = recovered;
                    }
                    sb
                }
                _ => Superblock::new(),
            }
        };

        rw.seek(SeekFrom::Start(PAGE_DATA_START as u64))?;
        let mut dedup = HashMap::new();
        let mut end_offset = PAGE_DATA_START as u64;
        loop {
            let pos = match rw.stream_position() {
                Ok(p) => p,
                Err(_) => break,
            };
            let header = match BlockHeader::read(&mut rw) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.block_type == BlockType::Index {
                break;
            }
            let comp_size = header.comp_size as u64;
            if !index.pages.iter().any(|p| p.archive_offset == pos) {
                index.pages.push(PageEntry {
                    file_offset: header.file_offset,
                    archive_offset: pos,
                    orig_size: header.orig_size as u64,
                    comp_size,
                    content_hash: header.content_hash,
                    bad: false,
                });
            }
            dedup.insert(header.content_hash, (pos, header.orig_size as u64, comp_size));
            let next = pos + crate::block::BLOCK_HEADER_SIZE as u64 + comp_size;
            end_offset = next;
            if rw.seek(SeekFrom::Start(next)).is_err() {
                break;
            }
        }

        rw.seek(SeekFrom::Start(end_offset))?;
        let page_counter = index.pages.len() as u64;

        Ok(Self {
            writer: rw,
            superblock,
            prime,
            codec: CodecId::None,
            level: 0,
            encryption_key: None,
            callback: Box::new(NullCallback),
            cur_offset: 0,
            page_counter,
            index,
            dedup,
        })
    }

    fn read_index_block(rw: &mut W, index_offset: u64) -> io::Result<PageIndex> {
        rw.seek(SeekFrom::Start(index_offset))?;
        let header = BlockHeader::read(&mut *rw)?;
        let mut payload = vec![0u8; header.comp_size as usize];
        rw.read_exact(&mut payload)?;
        let plaintext = crate::block::decode_block(&header, &payload, None)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

impl<W: Write + Seek> Sink for SixcySink<W> {
    fn set_sector_size(&mut self, bytes: u32) {
        self.prime.sector_size = bytes;
        let _ = self.rewrite_prime_header();
    }

    fn set_page_size(&mut self, bytes: u32) {
        self.prime.page_size = bytes;
        let _ = self.rewrite_prime_header();
    }

    fn set_max_size(&mut self, bytes: u64) {
        self.prime.max_size = bytes;
        let _ = self.rewrite_prime_header();
    }

    fn enable_compression(&mut self, codec: CodecId, level: i32) {
        self.codec = codec;
        self.level = level;
    }

    fn set_callback(&mut self, callback: Box<dyn SinkCallback>) {
        self.callback = callback;
    }

    fn set_acquisition_date(&mut self, rfc3339: &str) {
        let _ = self.update_seg("acquisition_date", rfc3339.as_bytes());
    }

    fn make_gid(&self) -> String {
        self.superblock.archive_uuid.to_string()
    }

    fn seek(&mut self, offset: u64) -> Result<(), crate::error::SinkError> {
        self.cur_offset = offset;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), crate::error::SinkError> {
        self.write_page(data).map_err(crate::error::SinkError::from)
    }

    fn tell(&self) -> u64 {
        self.cur_offset
    }

    fn bad_flag(&mut self, offset: u64, length: u64) -> Result<(), crate::error::SinkError> {
        let marker = vec![BAD_SECTOR_FILL; length as usize];
        let saved = self.cur_offset;
        self.cur_offset = offset;
        self.write_page(&marker)?;
        if let Some(last) = self.index.pages.last_mut() {
            last.bad = true;
        }
        self.cur_offset = saved.max(self.cur_offset);
        Ok(())
    }

    fn bad_flag_byte(&self) -> u8 {
        BAD_SECTOR_FILL
    }

    fn has_page(&self, offset: u64) -> bool {
        self.index.pages.iter().any(|p| p.file_offset == offset)
    }

    fn update_seg(&mut self, name: &str, value: &[u8]) -> Result<(), crate::error::SinkError> {
        self.index.segments.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn get_seg(&self, name: &str) -> Option<Vec<u8>> {
        self.index.segments.get(name).cloned()
    }

    fn del_seg(&mut self, name: &str) -> Result<(), crate::error::SinkError> {
        self.index.segments.remove(name);
        Ok(())
    }

    fn compression_type(&self) -> CodecId {
        self.codec
    }

    fn finalize(&mut self) -> Result<(), crate::error::SinkError> {
        self.prime.declared_size = self.cur_offset.max(
            self.index
                .pages
                .iter()
                .map(|p| p.file_offset + p.orig_size)
                .max()
                .unwrap_or(0),
        );
        self.rewrite_prime_header()?;

        let index_payload = serde_json::to_vec(&self.index)
            .map_err(|e| crate::error::SinkError::Other(e.to_string()))?;

        let (idx_header, idx_on_disk) = crate::block::encode_block(
            BlockType::Index,
            FILE_ID_SHARED,
            0,
            &index_payload,
            CodecId::Zstd,
            3,
            None,
        )
        .map_err(|e| crate::error::SinkError::Other(e.to_string()))?;

        let index_offset = self.writer.stream_position()?;
        idx_header.write(&mut self.writer)?;
        self.writer.write_all(&idx_on_disk)?;

        self.superblock.index_offset = index_offset;
        self.superblock.index_size = idx_on_disk.len() as u64;
        if self.encryption_key.is_some() {
            self.superblock.flags |= crate::superblock::SB_FLAG_ENCRYPTED;
        }

        self.writer.seek(SeekFrom::Start(0))?;
        self.superblock.write(&mut self.writer)?;
        Ok(())
    }
}

/// Read geometry and segments back out of a `.6cy` archive produced by
/// [`SixcySink`] — used by recover-scan and `verify`/`info`, including
/// against an interrupted run that was never finalized (the prime header
/// is eager; the INDEX block and patched superblock are not).
pub struct SixcySource<R: Read + Seek> {
    reader: R,
}

impl<R: Read + Seek> SixcySource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn read_prime_header(&mut self) -> io::Result<(u32, u32, u64, u64)> {
        self.reader.seek(SeekFrom::Start(SUPERBLOCK_SIZE as u64))?;
        let p = PrimeHeader::read(&mut self.reader)?;
        Ok((p.sector_size, p.page_size, p.max_size, p.declared_size))
    }

    /// Scan every block header sequentially, independent of the INDEX
    /// block — the same index-bypass technique `recovery::scan_file` uses
    /// for the pack/unpack container, here returning offset-addressed
    /// pages instead of named files.
    pub fn scan_pages(&mut self) -> io::Result<Vec<(u64, u64, u32, u32)>> {
        self.reader.seek(SeekFrom::Start(PAGE_DATA_START as u64))?;
        let mut out = Vec::new();
        loop {
            let pos = match self.reader.stream_position() {
                Ok(p) => p,
                Err(_) => break,
            };
            let header = match BlockHeader::read(&mut self.reader) {
                Ok(h) => h,
                Err(_) => break,
            };
            let skip = header.comp_size as u64;
            if header.block_type == BlockType::Index {
                break;
            }
            out.push((header.file_offset, pos, header.orig_size, header.comp_size));
            if self.reader.seek(SeekFrom::Current(skip as i64)).is_err() {
                break;
            }
        }
        Ok(out)
    }
}
