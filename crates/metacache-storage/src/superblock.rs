//! Superblock
//!
//! A fixed region at address 0. It records the encoding widths, the end of
//! allocation, and the two extension messages: the file-space info message
//! and the cache image location.
//!
//! Layout (little-endian, widths from the fixed header):
//! ```text
//! magic "MCSB" | version | sizeof_addr | sizeof_size | flags
//! | eoa (addr) | fsinfo length (u16) | fsinfo message
//! | image addr (addr) | image length (size) | crc32c
//! ```

use crate::fsinfo::FsInfoMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use metacache_common::{
    ByteWidths, CHECKSUM_LEN, Error, Result, UNDEF_ADDR, addr_defined, split_checked,
};

/// Superblock magic
pub const SUPERBLOCK_MAGIC: &[u8; 4] = b"MCSB";

/// Superblock format version
pub const SUPERBLOCK_VERSION: u8 = 0;

/// Bytes reserved for the superblock at the start of the file
pub const SUPERBLOCK_RESERVED: u64 = 512;

const FLAG_FSINFO: u8 = 0x01;
const FLAG_CACHE_IMAGE: u8 = 0x02;
const FIXED_HEADER_LEN: usize = 8;

/// Location of a cache image block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheImageLocation {
    /// Image block address (undefined while a placeholder)
    pub addr: u64,
    /// Image block length
    pub len: u64,
}

impl CacheImageLocation {
    /// Placeholder written before the image is laid out
    #[must_use]
    pub const fn placeholder() -> Self {
        Self {
            addr: UNDEF_ADDR,
            len: UNDEF_ADDR,
        }
    }
}

/// Messages stored in the superblock extension
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SuperblockExtension {
    /// File-space info message
    pub fsinfo: Option<FsInfoMessage>,
    /// Cache image location message
    pub cache_image: Option<CacheImageLocation>,
}

/// Decoded superblock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Encoding widths for every structure in the file
    pub widths: ByteWidths,
    /// End of allocation at last close
    pub eoa: u64,
    /// Extension messages
    pub ext: SuperblockExtension,
}

impl Superblock {
    /// Superblock for a freshly created file
    #[must_use]
    pub fn new(widths: ByteWidths) -> Self {
        Self {
            widths,
            eoa: SUPERBLOCK_RESERVED,
            ext: SuperblockExtension::default(),
        }
    }

    /// Serialize, failing if the result does not fit the reserved region
    pub fn to_bytes(&self) -> Result<Bytes> {
        let widths = self.widths;
        let fsinfo = self
            .ext
            .fsinfo
            .as_ref()
            .map(|msg| msg.encode(widths))
            .transpose()?;

        let mut flags = 0;
        if fsinfo.is_some() {
            flags |= FLAG_FSINFO;
        }
        if self.ext.cache_image.is_some() {
            flags |= FLAG_CACHE_IMAGE;
        }

        let mut buf = BytesMut::with_capacity(SUPERBLOCK_RESERVED as usize);
        buf.put_slice(SUPERBLOCK_MAGIC);
        buf.put_u8(SUPERBLOCK_VERSION);
        buf.put_u8(widths.addr.into());
        buf.put_u8(widths.size.into());
        buf.put_u8(flags);
        widths.put_addr(&mut buf, self.eoa)?;

        let encoded = fsinfo.unwrap_or_default();
        let fsinfo_len = u16::try_from(encoded.len())
            .map_err(|_| Error::invalid_argument("file-space info message too large"))?;
        buf.put_u16_le(fsinfo_len);
        buf.put_slice(&encoded);

        let image = self.ext.cache_image.unwrap_or(CacheImageLocation::placeholder());
        widths.put_addr(&mut buf, image.addr)?;
        if addr_defined(image.len) {
            widths.put_size(&mut buf, image.len)?;
        } else {
            widths.put_size(&mut buf, widths.size.max_value())?;
        }

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);

        if buf.len() as u64 > SUPERBLOCK_RESERVED {
            return Err(Error::invalid_argument(format!(
                "superblock needs {} bytes, only {SUPERBLOCK_RESERVED} reserved",
                buf.len()
            )));
        }
        Ok(buf.freeze())
    }

    /// Deserialize from the start of the reserved region
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN + 2 + CHECKSUM_LEN {
            return Err(Error::cannot_open("superblock truncated"));
        }
        if &data[..4] != SUPERBLOCK_MAGIC {
            return Err(Error::cannot_open("bad superblock signature"));
        }
        if data[4] != SUPERBLOCK_VERSION {
            return Err(Error::cannot_open(format!(
                "unsupported superblock version {}",
                data[4]
            )));
        }
        let widths = ByteWidths::new(data[5], data[6]).ok_or_else(|| {
            Error::cannot_open(format!("invalid encoding widths {}/{}", data[5], data[6]))
        })?;
        let flags = data[7];

        // The checksummed length depends on the fsinfo length field
        let fsinfo_len_at = FIXED_HEADER_LEN + widths.addr_len();
        if data.len() < fsinfo_len_at + 2 {
            return Err(Error::cannot_open("superblock truncated"));
        }
        let fsinfo_len =
            u16::from_le_bytes([data[fsinfo_len_at], data[fsinfo_len_at + 1]]) as usize;
        let total = fsinfo_len_at + 2 + fsinfo_len + widths.addr_len() + widths.size_len()
            + CHECKSUM_LEN;
        if data.len() < total {
            return Err(Error::cannot_open("superblock truncated"));
        }
        let body = split_checked(&data[..total])
            .ok_or_else(|| Error::cannot_open("superblock checksum mismatch"))?;

        let mut buf = &body[FIXED_HEADER_LEN..];
        let eoa = widths.get_addr(&mut buf);
        buf.advance(2);
        let fsinfo = if flags & FLAG_FSINFO != 0 {
            Some(FsInfoMessage::decode(&buf[..fsinfo_len], widths)?)
        } else {
            None
        };
        buf.advance(fsinfo_len);

        let addr = widths.get_addr(&mut buf);
        let len = widths.get_size(&mut buf);
        let cache_image = (flags & FLAG_CACHE_IMAGE != 0).then(|| CacheImageLocation {
            addr,
            len: if len == widths.size.max_value() { UNDEF_ADDR } else { len },
        });

        if !addr_defined(eoa) {
            return Err(Error::cannot_open("superblock has an undefined eoa"));
        }
        Ok(Self {
            widths,
            eoa,
            ext: SuperblockExtension { fsinfo, cache_image },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metacache_common::{FileSpaceConfig, FsCategory};

    #[test]
    fn test_new_superblock() {
        let sb = Superblock::new(ByteWidths::default());
        let bytes = sb.to_bytes().unwrap();
        assert_eq!(&bytes[..4], SUPERBLOCK_MAGIC);
        let back = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(back.eoa, SUPERBLOCK_RESERVED);
        assert!(back.ext.fsinfo.is_none());
        assert!(back.ext.cache_image.is_none());
    }

    #[test]
    fn test_superblock_with_messages() {
        let widths = ByteWidths::new(4, 4).unwrap();
        let config = FileSpaceConfig {
            persist: true,
            ..FileSpaceConfig::default()
        };
        let mut fsinfo = FsInfoMessage::from_config(&config);
        fsinfo.set_fs_addr(FsCategory::Draw, 0x2000);

        let mut sb = Superblock::new(widths);
        sb.eoa = 0x8000;
        sb.ext.fsinfo = Some(fsinfo.clone());
        sb.ext.cache_image = Some(CacheImageLocation {
            addr: 0x7000,
            len: 0x400,
        });

        // Read back from a larger zero-padded region, as after a file read
        let mut region = vec![0u8; SUPERBLOCK_RESERVED as usize];
        let bytes = sb.to_bytes().unwrap();
        region[..bytes.len()].copy_from_slice(&bytes);
        let back = Superblock::from_bytes(&region).unwrap();
        assert_eq!(back, sb);
        assert_eq!(back.ext.fsinfo.unwrap().fs_addr(FsCategory::Draw), 0x2000);
    }

    #[test]
    fn test_placeholder_image_location() {
        let mut sb = Superblock::new(ByteWidths::default());
        sb.ext.cache_image = Some(CacheImageLocation::placeholder());
        let back = Superblock::from_bytes(&sb.to_bytes().unwrap()).unwrap();
        assert_eq!(back.ext.cache_image, Some(CacheImageLocation::placeholder()));
    }

    #[test]
    fn test_corrupt_superblock() {
        let sb = Superblock::new(ByteWidths::default());
        let mut bytes = sb.to_bytes().unwrap().to_vec();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(Superblock::from_bytes(&bad_magic).unwrap_err().is_corruption());

        bytes[10] ^= 0xff;
        assert!(Superblock::from_bytes(&bytes).unwrap_err().is_corruption());

        assert!(Superblock::from_bytes(&[0u8; 4]).is_err());
    }
}
