use crate::error::Error;
use crate::ioutils::read_u64;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};

pub const FOOTER_MAGIC: u64 = 0x7469657264627431;
pub const FOOTER_SIZE: u64 = 56;

/// Fixed-size footer at the very end of a level file.
#[derive(Debug, PartialEq, Eq)]
pub struct Footer {
    pub root_offset: u64,
    pub msize: u64,
    pub zsize: u64,
    pub mdlen: u64,
    pub count: u64,
    pub flags: u64,
}

impl Footer {
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&self.root_offset.to_be_bytes())?;
        writer.write_all(&self.msize.to_be_bytes())?;
        writer.write_all(&self.zsize.to_be_bytes())?;
        writer.write_all(&self.mdlen.to_be_bytes())?;
        writer.write_all(&self.count.to_be_bytes())?;
        writer.write_all(&self.flags.to_be_bytes())?;
        writer.write_all(&FOOTER_MAGIC.to_be_bytes())?;
        Ok(())
    }

    /// Seek to the end of the file and read the footer back. The trailing
    /// magic word is part of the 56 footer bytes.
    pub fn load(reader: &mut (impl Read + Seek)) -> Result<Footer> {
        reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let footer = Footer {
            root_offset: read_u64(reader)?,
            msize: read_u64(reader)?,
            zsize: read_u64(reader)?,
            mdlen: read_u64(reader)?,
            count: read_u64(reader)?,
            flags: read_u64(reader)?,
        };
        if read_u64(reader)? != FOOTER_MAGIC {
            return Err(Error::corruption("bad footer magic number"));
        }
        Ok(footer)
    }
}

/// JSON metadata trailer. `flushunix` is written as a quoted string; the
/// parser accepts both the quoted and the bare form so the file format
/// stays round-trip compatible with itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub seqno: u64,
    pub flushunix: String,
}

impl Metadata {
    pub fn new(seqno: u64, flushunix: i64) -> Metadata {
        Metadata {
            seqno,
            flushunix: flushunix.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Metadata> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let seqno = value
            .get("seqno")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::corruption("metadata missing seqno"))?;
        let flushunix = match value.get("flushunix") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(Error::corruption("metadata missing flushunix")),
        };
        Ok(Metadata { seqno, flushunix })
    }

    pub fn flushunix_secs(&self) -> Result<i64> {
        self.flushunix
            .parse::<i64>()
            .map_err(|_| Error::corruption("flushunix is not a unix timestamp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_footer_round_trip() {
        let footer = Footer {
            root_offset: 8192,
            msize: 4096,
            zsize: 4096,
            mdlen: 54,
            count: 10_000,
            flags: 0,
        };
        let mut buf = Vec::new();
        footer.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, FOOTER_SIZE);

        let mut cursor = Cursor::new(buf);
        let read = Footer::load(&mut cursor).unwrap();
        assert_eq!(read, footer);
    }

    #[test]
    fn test_metadata_round_trip() {
        let md = Metadata::new(991, 1700000000);
        let data = md.encode().unwrap();
        // the timestamp is serialized as a quoted string
        assert!(String::from_utf8_lossy(&data).contains("\"1700000000\""));
        let back = Metadata::decode(&data).unwrap();
        assert_eq!(back.seqno, 991);
        assert_eq!(back.flushunix_secs().unwrap(), 1700000000);
    }

    #[test]
    fn test_metadata_accepts_bare_integer() {
        let back = Metadata::decode(br#"{"seqno":5,"flushunix":123}"#).unwrap();
        assert_eq!(back.flushunix_secs().unwrap(), 123);
        assert!(Metadata::decode(br#"{"flushunix":"123"}"#).is_err());
    }
}
