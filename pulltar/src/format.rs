use crate::{error, Result};

/// Number of bytes of the archive to sniff when detecting the format.
///
/// One tar block is enough to cover both magic numbers we look for.
pub(crate) const HEADER_SNIFF_LEN: usize = 512;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The `ustar` magic sits at this offset in the first tar header block.
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// The archive formats that can be unpacked.
///
/// The format is never specified by the caller; it's always detected by sniffing the leading
/// bytes of the archive itself with [`ArchiveFormat::detect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// An uncompressed `tar` archive
    Tar,

    /// A `tar` archive compressed with gzip
    TarGz,
}

impl ArchiveFormat {
    /// Detect the archive format from the leading bytes of the archive.
    ///
    /// `header` doesn't have to be a full 512 byte tar block; archives smaller than that yield
    /// however many bytes they have.  Gzip is recognized by its two byte magic number, and
    /// uncompressed tar by the `ustar` magic at offset 257 of the first header block.  Anything
    /// else fails with [`crate::PullTarError::UnrecognizedFormat`].
    pub fn detect(header: &[u8]) -> Result<Self> {
        if header.len() >= GZIP_MAGIC.len() && header[..GZIP_MAGIC.len()] == GZIP_MAGIC {
            return Ok(ArchiveFormat::TarGz);
        }

        if header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
            && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
        {
            return Ok(ArchiveFormat::Tar);
        }

        error::UnrecognizedFormatSnafu {}.fail()
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveFormat::Tar => write!(f, "tar"),
            ArchiveFormat::TarGz => write!(f, "tar.gz"),
        }
    }
}
