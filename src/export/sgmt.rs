//! SGMT segment container
//!
//! Layout of an `.sgmt` file:
//! - magic `SGMT`, format version (`u16` LE)
//! - track table: `u32` LE length followed by JSON (`{"tracks": [...]}`)
//! - sample records until EOF: track `u8`, flags `u8`, pts_us `i64` LE,
//!   duration_us `u32` LE, size `u32` LE, then `size` bytes of payload
//!
//! Records of one track appear in decode order. Records of different tracks
//! may be interleaved freely.

use crate::export::container::{ContainerFormat, ContainerReader, ContainerWriter};
use crate::export::types::{MergeError, Sample, TrackFormat};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const SGMT_MAGIC: &[u8; 4] = b"SGMT";
pub const SGMT_VERSION: u16 = 1;
pub const SGMT_EXTENSION: &str = "sgmt";

const RECORD_HEADER_LEN: usize = 18;

#[derive(Debug, Serialize, Deserialize)]
struct SgmtHeader {
    tracks: Vec<TrackFormat>,
}

/// The SGMT container family
#[derive(Debug, Clone, Copy, Default)]
pub struct SgmtFormat;

impl ContainerFormat for SgmtFormat {
    fn open(&self, path: &Path) -> Result<Box<dyn ContainerReader>, MergeError> {
        Ok(Box::new(SgmtReader::open(path)?))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn ContainerWriter>, MergeError> {
        Ok(Box::new(SgmtWriter::create(path)?))
    }

    fn extension(&self) -> &'static str {
        SGMT_EXTENSION
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordIndex {
    track: u8,
    flags: u8,
    pts_us: i64,
    duration_us: u32,
    offset: u64,
    size: u32,
}

/// Reader over an SGMT file
///
/// The record index is built on open; payloads are read lazily.
pub struct SgmtReader {
    file: BufReader<File>,
    tracks: Vec<TrackFormat>,
    records: Vec<RecordIndex>,
}

impl SgmtReader {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        read_exact_or_invalid(&mut reader, &mut magic, path, "missing file header")?;
        if &magic != SGMT_MAGIC {
            return Err(MergeError::invalid(path, "not an SGMT file"));
        }

        let mut version = [0u8; 2];
        read_exact_or_invalid(&mut reader, &mut version, path, "missing format version")?;
        let version = u16::from_le_bytes(version);
        if version != SGMT_VERSION {
            return Err(MergeError::invalid(
                path,
                format!("unsupported format version {}", version),
            ));
        }

        let mut header_len = [0u8; 4];
        read_exact_or_invalid(&mut reader, &mut header_len, path, "missing track table")?;
        let header_len = u32::from_le_bytes(header_len);
        if u64::from(header_len) > file_len {
            return Err(MergeError::invalid(path, "track table exceeds file size"));
        }
        let mut header = vec![0u8; header_len as usize];
        read_exact_or_invalid(&mut reader, &mut header, path, "truncated track table")?;
        let header: SgmtHeader = serde_json::from_slice(&header)?;

        let mut offset = (SGMT_MAGIC.len() + 2 + 4) as u64 + u64::from(header_len);
        let mut records = Vec::new();

        loop {
            let raw = match read_record_header(&mut reader) {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(MergeError::invalid(path, "truncated sample record"));
                }
                Err(e) => return Err(e.into()),
            };
            offset += RECORD_HEADER_LEN as u64;

            let record = RecordIndex {
                track: raw[0],
                flags: raw[1],
                pts_us: i64::from_le_bytes(field(&raw[2..10])),
                duration_us: u32::from_le_bytes(field(&raw[10..14])),
                offset,
                size: u32::from_le_bytes(field(&raw[14..18])),
            };

            if usize::from(record.track) >= header.tracks.len() {
                return Err(MergeError::invalid(
                    path,
                    format!("sample references unknown track {}", record.track),
                ));
            }
            if offset + u64::from(record.size) > file_len {
                return Err(MergeError::invalid(path, "truncated sample payload"));
            }

            reader.seek_relative(i64::from(record.size))?;
            offset += u64::from(record.size);
            records.push(record);
        }

        tracing::debug!(
            "Opened {:?}: {} tracks, {} samples",
            path,
            header.tracks.len(),
            records.len()
        );

        Ok(Self {
            file: reader,
            tracks: header.tracks,
            records,
        })
    }

    /// Number of samples stored for one track
    pub fn sample_count(&self, track: usize) -> usize {
        self.records
            .iter()
            .filter(|r| usize::from(r.track) == track)
            .count()
    }
}

impl ContainerReader for SgmtReader {
    fn tracks(&self) -> &[TrackFormat] {
        &self.tracks
    }

    fn samples<'a>(
        &'a mut self,
        track: usize,
    ) -> Box<dyn Iterator<Item = Result<Sample, MergeError>> + 'a> {
        let file = &mut self.file;
        Box::new(
            self.records
                .iter()
                .filter(move |r| usize::from(r.track) == track)
                .map(move |r| -> Result<Sample, MergeError> {
                    file.seek(SeekFrom::Start(r.offset))?;
                    let mut data = vec![0u8; r.size as usize];
                    file.read_exact(&mut data)?;
                    Ok(Sample {
                        pts_us: r.pts_us,
                        duration_us: r.duration_us,
                        flags: r.flags,
                        data,
                    })
                }),
        )
    }
}

/// Writer producing an SGMT file
///
/// Data goes to a hidden temporary file next to the destination and is
/// renamed into place by `finish`.
pub struct SgmtWriter {
    dest: PathBuf,
    file: BufWriter<NamedTempFile>,
    tracks: Vec<TrackFormat>,
    header_written: bool,
}

impl SgmtWriter {
    pub fn create(dest: &Path) -> Result<Self, MergeError> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let temp = tempfile::Builder::new()
            .prefix(".sgmt-")
            .suffix(".partial")
            .tempfile_in(&dir)?;

        Ok(Self {
            dest: dest.to_path_buf(),
            file: BufWriter::new(temp),
            tracks: Vec::new(),
            header_written: false,
        })
    }

    fn write_header(&mut self) -> Result<(), MergeError> {
        let header = serde_json::to_vec(&SgmtHeader {
            tracks: self.tracks.clone(),
        })?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| MergeError::invalid(&self.dest, "track table too large"))?;

        self.file.write_all(SGMT_MAGIC)?;
        self.file.write_all(&SGMT_VERSION.to_le_bytes())?;
        self.file.write_all(&header_len.to_le_bytes())?;
        self.file.write_all(&header)?;
        self.header_written = true;
        Ok(())
    }
}

impl ContainerWriter for SgmtWriter {
    fn add_track(&mut self, format: TrackFormat) -> Result<usize, MergeError> {
        if self.header_written {
            return Err(MergeError::invalid(
                &self.dest,
                "tracks must be added before the first sample",
            ));
        }
        if self.tracks.len() >= usize::from(u8::MAX) {
            return Err(MergeError::invalid(&self.dest, "too many tracks"));
        }
        self.tracks.push(format);
        Ok(self.tracks.len() - 1)
    }

    fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<(), MergeError> {
        let track_id = u8::try_from(track)
            .ok()
            .filter(|t| usize::from(*t) < self.tracks.len())
            .ok_or_else(|| MergeError::invalid(&self.dest, format!("unknown track {}", track)))?;
        let size = u32::try_from(sample.data.len())
            .map_err(|_| MergeError::invalid(&self.dest, "sample payload too large"))?;

        if !self.header_written {
            self.write_header()?;
        }

        let mut record = [0u8; RECORD_HEADER_LEN];
        record[0] = track_id;
        record[1] = sample.flags;
        record[2..10].copy_from_slice(&sample.pts_us.to_le_bytes());
        record[10..14].copy_from_slice(&sample.duration_us.to_le_bytes());
        record[14..18].copy_from_slice(&size.to_le_bytes());

        self.file.write_all(&record)?;
        self.file.write_all(&sample.data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), MergeError> {
        let mut this = *self;
        if !this.header_written {
            this.write_header()?;
        }

        let temp = this
            .file
            .into_inner()
            .map_err(|e| MergeError::Io(e.into_error()))?;
        temp.as_file().sync_all()?;
        temp.persist(&this.dest).map_err(|e| MergeError::Io(e.error))?;

        tracing::debug!("Finalized {:?}", this.dest);
        Ok(())
    }
}

fn field<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn read_exact_or_invalid(
    reader: &mut impl Read,
    buf: &mut [u8],
    path: &Path,
    reason: &str,
) -> Result<(), MergeError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            MergeError::invalid(path, reason)
        } else {
            MergeError::Io(e)
        }
    })
}

/// Read one record header; `None` on a clean end of file
fn read_record_header(reader: &mut impl Read) -> io::Result<Option<[u8; RECORD_HEADER_LEN]>> {
    let mut buf = [0u8; RECORD_HEADER_LEN];
    let mut filled = 0;
    while filled < RECORD_HEADER_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::types::{TrackKind, SAMPLE_FLAG_KEY_FRAME};
    use tempfile::tempdir;

    fn sample(pts_us: i64, flags: u8, payload: &[u8]) -> Sample {
        Sample {
            pts_us,
            duration_us: 40_000,
            flags,
            data: payload.to_vec(),
        }
    }

    fn write_av(path: &Path) {
        let mut writer: Box<dyn ContainerWriter> = Box::new(SgmtWriter::create(path).unwrap());
        let video = writer.add_track(TrackFormat::video("h264", 1280, 720)).unwrap();
        let audio = writer.add_track(TrackFormat::audio("aac", 48_000, 2)).unwrap();

        writer.write_sample(video, &sample(0, SAMPLE_FLAG_KEY_FRAME, b"v0")).unwrap();
        writer.write_sample(audio, &sample(0, 0, b"a0")).unwrap();
        writer.write_sample(video, &sample(40_000, 0, b"v1")).unwrap();
        writer.write_sample(audio, &sample(21_333, 0, b"a1")).unwrap();
        writer.write_sample(video, &sample(80_000, 0x06, b"v2")).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_write_and_read_interleaved_tracks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.sgmt");
        write_av(&path);

        let mut reader = SgmtReader::open(&path).unwrap();
        assert_eq!(reader.tracks().len(), 2);
        assert_eq!(reader.tracks()[0].kind, TrackKind::Video);
        assert_eq!(reader.tracks()[1].sample_rate, Some(48_000));
        assert_eq!(reader.sample_count(0), 3);
        assert_eq!(reader.sample_count(1), 2);

        let video: Vec<Sample> = reader.samples(0).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            video.iter().map(|s| s.pts_us).collect::<Vec<_>>(),
            vec![0, 40_000, 80_000]
        );
        assert!(video[0].is_key_frame());
        assert_eq!(video[2].flags, 0x06);
        assert_eq!(video[1].data, b"v1");

        let audio: Vec<Sample> = reader.samples(1).collect::<Result<_, _>>().unwrap();
        assert_eq!(audio[1].data, b"a1");
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.sgmt");
        write_av(&path);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        match SgmtReader::open(&path) {
            Err(MergeError::InvalidContainer { reason, .. }) => {
                assert!(reason.contains("truncated"))
            }
            other => panic!("expected InvalidContainer, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, b"\0\0\0\x18ftypmp42").unwrap();

        assert!(matches!(
            SgmtReader::open(&path),
            Err(MergeError::InvalidContainer { .. })
        ));
    }

    #[test]
    fn test_unfinished_writer_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.sgmt");
        {
            let mut writer = SgmtWriter::create(&path).unwrap();
            let track = writer.add_track(TrackFormat::video("h264", 640, 480)).unwrap();
            writer.write_sample(track, &sample(0, SAMPLE_FLAG_KEY_FRAME, b"v0")).unwrap();
        }

        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_tracks_are_fixed_after_first_sample() {
        let dir = tempdir().unwrap();
        let mut writer = SgmtWriter::create(&dir.path().join("out.sgmt")).unwrap();
        let track = writer.add_track(TrackFormat::video("h264", 640, 480)).unwrap();
        writer.write_sample(track, &sample(0, 0, b"v0")).unwrap();

        assert!(writer.add_track(TrackFormat::audio("aac", 44_100, 1)).is_err());
        assert!(writer.write_sample(5, &sample(0, 0, b"x")).is_err());
    }
}
