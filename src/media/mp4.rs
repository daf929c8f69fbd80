//! ISO base media (MP4 / QuickTime) container sanity checks.
//!
//! Walks top-level boxes so truncated or corrupt containers are rejected
//! before any decoder sees them.

use std::io::{self, Read, Seek, SeekFrom};

use thiserror::Error;

use crate::content_type::normalize_mime;

const ISO_BMFF_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/quicktime",
    "video/x-m4v",
    "video/3gpp",
    "video/3gpp2",
];

#[derive(Error, Debug)]
pub enum Mp4Error {
    #[error("Box {box_type} at offset {offset} extends past end of file")]
    Truncated { box_type: String, offset: u64 },

    #[error("Invalid box header at offset {0}")]
    InvalidBox(u64),

    #[error("No movie box")]
    MissingMovie,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level container summary
#[derive(Debug, Clone, PartialEq)]
pub struct Mp4Summary {
    /// Seconds, from the movie header
    pub duration: Option<f64>,
}

/// Whether a MIME type uses an ISO base media container
pub fn is_iso_bmff(mime_type: &str) -> bool {
    ISO_BMFF_MIME_TYPES.contains(&normalize_mime(mime_type).as_str())
}

struct BoxHeader {
    box_type: [u8; 4],
    offset: u64,
    header_len: u64,
    end: u64,
}

fn read_box_header<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    limit: u64,
) -> Result<BoxHeader, Mp4Error> {
    if limit - offset < 8 {
        return Err(Mp4Error::InvalidBox(offset));
    }

    reader.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;

    let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
    let box_type = [header[4], header[5], header[6], header[7]];

    let (size, header_len) = match size32 {
        0 => (limit - offset, 8),
        1 => {
            if limit - offset < 16 {
                return Err(Mp4Error::InvalidBox(offset));
            }
            let mut large = [0u8; 8];
            reader.read_exact(&mut large)?;
            (u64::from_be_bytes(large), 16)
        }
        n => (n, 8),
    };

    if size < header_len {
        return Err(Mp4Error::InvalidBox(offset));
    }

    let end = offset
        .checked_add(size)
        .ok_or(Mp4Error::InvalidBox(offset))?;
    if end > limit {
        return Err(Mp4Error::Truncated {
            box_type: String::from_utf8_lossy(&box_type).into_owned(),
            offset,
        });
    }

    Ok(BoxHeader {
        box_type,
        offset,
        header_len,
        end,
    })
}

fn read_movie_duration<R: Read + Seek>(
    reader: &mut R,
    moov: &BoxHeader,
) -> Result<Option<f64>, Mp4Error> {
    let mut offset = moov.offset + moov.header_len;
    while offset < moov.end {
        let child = read_box_header(reader, offset, moov.end)?;
        if &child.box_type == b"mvhd" {
            reader.seek(SeekFrom::Start(child.offset + child.header_len))?;
            let mut version = [0u8; 4];
            reader.read_exact(&mut version)?;

            let (timescale, duration) = if version[0] == 1 {
                let mut body = [0u8; 28];
                reader.read_exact(&mut body)?;
                let timescale = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
                let mut duration = [0u8; 8];
                duration.copy_from_slice(&body[20..28]);
                (timescale, u64::from_be_bytes(duration))
            } else {
                let mut body = [0u8; 16];
                reader.read_exact(&mut body)?;
                let timescale = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
                let duration = u32::from_be_bytes([body[12], body[13], body[14], body[15]]);
                (timescale, u64::from(duration))
            };

            if timescale == 0 {
                return Ok(None);
            }
            return Ok(Some(duration as f64 / f64::from(timescale)));
        }
        offset = child.end;
    }
    Ok(None)
}

/// Check the top-level box structure and read the movie duration
pub fn inspect<R: Read + Seek>(mut reader: R) -> Result<Mp4Summary, Mp4Error> {
    let file_length = reader.seek(SeekFrom::End(0))?;

    let mut duration = None;
    let mut saw_movie = false;
    let mut offset = 0;

    while offset < file_length {
        let header = read_box_header(&mut reader, offset, file_length)?;
        if &header.box_type == b"moov" {
            saw_movie = true;
            duration = read_movie_duration(&mut reader, &header)?;
        }
        offset = header.end;
    }

    if !saw_movie {
        return Err(Mp4Error::MissingMovie);
    }

    Ok(Mp4Summary { duration })
}

#[cfg(test)]
pub(crate) fn minimal_mp4(timescale: u32, duration: u32) -> Vec<u8> {
    fn boxed(box_type: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(box_type);
        out.extend_from_slice(body);
        out
    }

    let mut ftyp = b"isom".to_vec();
    ftyp.extend_from_slice(&512u32.to_be_bytes());
    ftyp.extend_from_slice(b"isommp41");

    let mut mvhd = vec![0u8; 4];
    mvhd.extend_from_slice(&0u32.to_be_bytes());
    mvhd.extend_from_slice(&0u32.to_be_bytes());
    mvhd.extend_from_slice(&timescale.to_be_bytes());
    mvhd.extend_from_slice(&duration.to_be_bytes());
    mvhd.extend_from_slice(&[0u8; 80]);

    let mut out = boxed(b"ftyp", &ftyp);
    out.extend_from_slice(&boxed(b"moov", &boxed(b"mvhd", &mvhd)));
    out.extend_from_slice(&boxed(b"mdat", &[0u8; 64]));
    out
}
