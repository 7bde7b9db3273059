//! Build tar and tar.gz archives in memory, for extraction tests to pull apart again.
use crate::test_data::TestFileWithData;
use crate::Result;
use flate2::{write::GzEncoder, Compression};
use std::collections::HashMap;
use std::io::Write;

/// Build a tar archive holding all of the test files, in a stable order.
///
/// Entries are regular files only; any directories in the test file paths are left implicit, the
/// way most tar tools write them when told to archive individual files.
pub fn build_tar(files: &HashMap<String, TestFileWithData>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    // Sort so the archive layout doesn't change run to run
    let mut paths = files.keys().collect::<Vec<_>>();
    paths.sort();

    println!("Building tar archive fixture:");
    for path in paths {
        let file = &files[path];

        println!("  {} ({} bytes)", path, file.data.len());

        let mut header = tar::Header::new_gnu();
        header.set_size(file.data.len() as u64);
        header.set_mode(0o644);

        builder.append_data(&mut header, path, file.data.as_slice())?;
    }

    Ok(builder.into_inner()?)
}

/// Build a gzip-compressed tar archive holding all of the test files.
pub fn build_tar_gz(files: &HashMap<String, TestFileWithData>) -> Result<Vec<u8>> {
    let tar = build_tar(files)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar)?;

    Ok(encoder.finish()?)
}
