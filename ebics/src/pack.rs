//! Payload packaging: zlib compression and C5x ZIP archives

use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Cursor, Read, Write};

/// zlib-deflate, as EBICS order data requires.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    encoder.write_all(data).expect("write to Vec");
    encoder.finish().expect("finish to Vec")
}

/// Inverse of [`deflate`].
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Crypto(format!("zlib inflate failed: {}", e)))?;
    Ok(out)
}

/// Pack named documents into a ZIP archive (C5x download payload).
pub fn zip_pack(documents: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, body) in documents {
        writer
            .start_file(name, options)
            .map_err(|e| Error::Crypto(format!("ZIP write failed: {}", e)))?;
        writer
            .write_all(body)
            .map_err(|e| Error::Crypto(format!("ZIP write failed: {}", e)))?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| Error::Crypto(format!("ZIP finish failed: {}", e)))?;
    Ok(cursor.into_inner())
}

/// Unpack every file of a ZIP archive, in archive order.
pub fn zip_unpack(archive: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| Error::Crypto(format!("ZIP parse failed: {}", e)))?;
    let mut out = Vec::with_capacity(reader.len());
    for i in 0..reader.len() {
        let mut file = reader
            .by_index(i)
            .map_err(|e| Error::Crypto(format!("ZIP entry read failed: {}", e)))?;
        let mut body = Vec::new();
        file.read_to_end(&mut body)
            .map_err(|e| Error::Crypto(format!("ZIP entry read failed: {}", e)))?;
        out.push(body);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_roundtrip() {
        let data = b"<Document>statement</Document>".repeat(50);
        let packed = deflate(&data);
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(inflate(b"definitely not zlib").is_err());
    }

    #[test]
    fn zip_roundtrip_preserves_order() {
        let docs = vec![
            ("camt-1.xml".to_string(), b"<Document>1</Document>".to_vec()),
            ("camt-2.xml".to_string(), b"<Document>2</Document>".to_vec()),
        ];
        let archive = zip_pack(&docs).unwrap();
        let unpacked = zip_unpack(&archive).unwrap();
        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked[0], docs[0].1);
        assert_eq!(unpacked[1], docs[1].1);
    }
}
