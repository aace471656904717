//! Media classification from file signatures.
//!
//! References:
//! https://www.garykessler.net/library/file_sigs.html

use crate::error::{Error, Result};
use crate::models::MediaType;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const SNIFF_LEN: usize = 32;

const PHOTO_SIGNATURES: &[&[u8]] = &[
    &[0xFF, 0xD8, 0xFF],                                     // jpeg
    &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],       // png
    b"GIF87a",
    b"GIF89a",
    &[0x49, 0x49, 0x2A, 0x00], // tiff little endian, also cr2/nef/dng/arw
    &[0x4D, 0x4D, 0x00, 0x2A], // tiff big endian
    &[0x42, 0x4D],             // bmp
    b"FUJIFILMCCD-RAW",        // raf
    &[0x49, 0x49, 0x55, 0x00], // panasonic rw2
];

const VIDEO_SIGNATURES: &[&[u8]] = &[
    &[0x1A, 0x45, 0xDF, 0xA3],       // mkv, webm
    &[0x00, 0x00, 0x01, 0xBA],       // mpeg program stream
    &[0x00, 0x00, 0x01, 0xB3],       // mpeg video
    b"FLV",
    &[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11], // asf, wmv
    b"OggS",
];

/// ISO base media brands that carry still images rather than video.
const IMAGE_BRANDS: &[&[u8; 4]] = &[b"heic", b"heix", b"heim", b"heis", b"mif1", b"msf1", b"avif"];

/// Classifies a file by its leading bytes. `None` means the file is not indexable content.
pub fn sniff(path: &Path) -> Result<Option<MediaType>> {
    let mut file = File::open(path).map_err(|err| Error::io_at(path, err))?;
    let mut header = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        match file.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::io_at(path, err)),
        }
    }
    Ok(classify(&header[..filled]))
}

pub fn classify(header: &[u8]) -> Option<MediaType> {
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        let brand = &header[8..12];
        if IMAGE_BRANDS.iter().any(|b| b.as_slice() == brand) {
            return Some(MediaType::Photo);
        }
        return Some(MediaType::Video);
    }
    if header.len() >= 12 && header.starts_with(b"RIFF") {
        return match &header[8..12] {
            b"WEBP" => Some(MediaType::Photo),
            b"AVI " => Some(MediaType::Video),
            _ => None,
        };
    }
    if PHOTO_SIGNATURES.iter().any(|sig| header.starts_with(sig)) {
        return Some(MediaType::Photo);
    }
    if VIDEO_SIGNATURES.iter().any(|sig| header.starts_with(sig)) {
        return Some(MediaType::Video);
    }
    None
}
