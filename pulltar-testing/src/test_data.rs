//! Random fixture files for archive tests, and validation of what an extraction produced.
use crate::Result;
use bytes::Bytes;
use rand::prelude::*;
use sha2::Digest;
use std::{
    borrow::Cow,
    collections::HashMap,
    path::{Path, PathBuf},
};
use url::Url;

/// Spec for one file in an archive fixture.
#[derive(Clone, Debug)]
pub struct TestFile {
    pub path: String,
    pub size: usize,
}

impl TestFile {
    /// Describe a fixture file, with the size given in human units like "512B" or "10 KiB".
    pub fn new(path: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            path: path.into(),
            size: size.get_bytes() as usize,
        }
    }
}

/// A fixture file together with its generated contents and their digest.
#[derive(Clone, Debug)]
pub struct TestFileWithData {
    pub path: String,
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

/// Compute the SHA-256 digest of a byte slice.
fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);

    hasher.finalize().into()
}

/// Fill in each fixture file spec with random contents.
///
/// The returned table is keyed by the file's path within the archive.
pub fn make_test_files(
    files: impl IntoIterator<Item = TestFile>,
) -> Result<HashMap<String, TestFileWithData>> {
    let mut rng = rand::thread_rng();
    let mut generated = HashMap::new();

    for TestFile { path, size } in files {
        let mut data = vec![0u8; size];
        rng.fill(&mut data[..]);
        let hash = sha256(&data);

        if let Some(clash) = generated.insert(path.clone(), TestFileWithData { path, data, hash })
        {
            panic!("BUG: fixture uses the path '{}' twice", clash.path);
        }
    }

    Ok(generated)
}

/// Upload an already-built archive to a bucket, returning the `s3://` URL of the new object.
pub async fn upload_archive(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    data: Vec<u8>,
) -> Result<Url> {
    let body = aws_sdk_s3::primitives::ByteStream::from(Bytes::from(data));

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await?;

    Ok(format!("s3://{bucket}/{key}").parse()?)
}

/// Check the files under `dir` against the fixture data.
///
/// `expected_paths` names the subset of `test_data` entries that should have been extracted.
/// Every expected file must exist under `dir` with matching contents, and `dir` must not hold
/// any file that isn't expected.
#[track_caller]
pub async fn validate_test_data_in_dir<Keys, Item>(
    test_data: &HashMap<String, TestFileWithData>,
    dir: &Path,
    expected_paths: Keys,
) -> Result<()>
where
    Keys: IntoIterator<Item = Item>,
    Item: Into<Cow<'static, str>>,
{
    let found = list_files_relative(dir)?;

    println!(
        "Extracted dir {} holds {} file(s):",
        dir.display(),
        found.len()
    );
    for path in &found {
        println!("  {}", path.display());
    }

    // Resolve the expected keys against the fixture table up front; a key with no fixture
    // entry is a bug in the test itself
    let mut expected: HashMap<String, &TestFileWithData> = expected_paths
        .into_iter()
        .map(|item| {
            let key = item.into().into_owned();
            let data = test_data.get(&key).unwrap_or_else(|| {
                panic!("BUG: expected path '{key}' has no entry in the fixture data")
            });

            (key, data)
        })
        .collect();

    for relative_path in found {
        let key = relative_path.to_string_lossy();
        let fixture = expected.remove(key.as_ref()).unwrap_or_else(|| {
            panic!(
                "extracted dir contains '{}' which no fixture entry expects",
                relative_path.display()
            )
        });

        let contents = tokio::fs::read(dir.join(&relative_path)).await?;

        assert_eq!(
            sha256(&contents),
            fixture.hash,
            "contents of extracted file '{key}' don't match the fixture data"
        );
    }

    // Anything left in `expected` never showed up on disk
    assert!(
        expected.is_empty(),
        "expected file(s) missing from the extracted dir: {}",
        expected.keys().cloned().collect::<Vec<_>>().join(", ")
    );

    Ok(())
}

/// Recursively list the files under `dir`, as paths relative to `dir`.
fn list_files_relative(dir: &Path) -> Result<Vec<PathBuf>> {
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter(|entry| match entry {
            Ok(entry) => !entry.file_type().is_dir(),
            // Walk errors pass through so the caller reports them
            Err(_) => true,
        })
        .map(|entry| {
            let entry = entry?;

            Ok(entry.path().strip_prefix(dir)?.to_owned())
        })
        .collect()
}
