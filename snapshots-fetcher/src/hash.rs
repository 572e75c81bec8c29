//! Content address verification.
//!
//! Content addresses come in two textual flavours: legacy ones starting with `Qm`, which are
//! base58 encoded CIDv0, and modern ones starting with `ba`, which are base32 encoded CIDv1.
//! Raw CIDs carry the multihash of the content bytes. Protobuf CIDs carry the multihash of
//! the root node of the content's UnixFS file DAG, which is rebuilt to verify a download.
use std::path::Path;

use cid::{Cid, Version};
use multihash_codetable::{Code, MultihashDigest};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};

use crate::unixfs::{self, Leaves};

const LEGACY_PREFIX: &str = "Qm";
const MODERN_PREFIX: &str = "ba";

/// Multihash code of sha2-256.
const SHA2_256: u64 = 0x12;

/// The hashing scheme a content address uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashScheme {
    /// `Qm...`, a CIDv0.
    Legacy,
    /// `ba...`, a CIDv1.
    Modern,
}

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum HashError {
    #[snafu(display("Unsupported content address format: {hash}"))]
    UnsupportedFormat { hash: String },
    #[snafu(display("Invalid content address {hash}"))]
    InvalidCid { hash: String, source: cid::Error },
    #[snafu(display("Content address {hash} uses the wrong CID version for its prefix"))]
    VersionMismatch { hash: String },
    #[snafu(display("Unsupported codec {codec:#x}"))]
    UnsupportedCodec { codec: u64 },
    #[snafu(display("Unsupported multihash code {code:#x}"))]
    UnsupportedCode { code: u64 },
    #[snafu(display("Content does not match {expected}"))]
    Mismatch { expected: String },
    #[snafu(display("Failed to read content"))]
    Io { source: std::io::Error },
}

/// Determines the hashing scheme from the textual prefix of a content address.
pub fn scheme(hash: &str) -> Result<HashScheme, HashError> {
    if hash.starts_with(LEGACY_PREFIX) {
        Ok(HashScheme::Legacy)
    } else if hash.starts_with(MODERN_PREFIX) {
        Ok(HashScheme::Modern)
    } else {
        UnsupportedFormatSnafu { hash }.fail()
    }
}

/// Verifies that `bytes` hash to the content address `hash`.
///
/// Raw CIDs are compared against the digest of `bytes`. Protobuf CIDs are compared against
/// the root of the UnixFS file DAG rebuilt from `bytes`, with raw or wrapped leaves.
pub fn verify(hash: &str, bytes: &[u8]) -> Result<(), HashError> {
    let scheme = scheme(hash)?;
    let cid = Cid::try_from(hash).context(InvalidCidSnafu { hash })?;
    let expected_version = match scheme {
        HashScheme::Legacy => Version::V0,
        HashScheme::Modern => Version::V1,
    };
    ensure!(cid.version() == expected_version, VersionMismatchSnafu { hash });

    let code = cid.hash().code();
    let matches = match cid.codec() {
        unixfs::RAW_CODEC => {
            let code = Code::try_from(code).map_err(|_| UnsupportedCodeSnafu { code }.build())?;
            &code.digest(bytes) == cid.hash()
        }
        unixfs::DAG_PB_CODEC => {
            ensure!(code == SHA2_256, UnsupportedCodeSnafu { code });
            let leaves: &[Leaves] = match cid.version() {
                Version::V0 => &[Leaves::Pb],
                Version::V1 => &[Leaves::Raw, Leaves::Pb],
            };
            let mut matches = false;
            for leaves in leaves {
                let root = unixfs::file_root(bytes, cid.version(), *leaves)
                    .context(InvalidCidSnafu { hash })?;
                if root == cid {
                    matches = true;
                    break;
                }
            }
            matches
        }
        codec => return UnsupportedCodecSnafu { codec }.fail(),
    };
    ensure!(
        matches,
        MismatchSnafu {
            expected: hash.to_string()
        }
    );
    Ok(())
}

/// Verifies the file at `path` against the content address `hash`.
pub async fn verify_file(hash: &str, path: impl AsRef<Path>) -> Result<(), HashError> {
    // fail on the format before touching the file
    scheme(hash)?;
    let bytes = tokio::fs::read(path).await.context(IoSnafu)?;
    verify(hash, &bytes)
}

/// Computes the legacy (`Qm...`) content address of `bytes`, a UnixFS file.
pub fn legacy_hash(bytes: &[u8]) -> Result<String, HashError> {
    let cid = unixfs::file_root(bytes, Version::V0, Leaves::Pb).context(InvalidCidSnafu {
        hash: "UnixFS root",
    })?;
    Ok(cid.to_string())
}

/// Computes the modern (`ba...`) content address of `bytes`, as raw content.
pub fn modern_hash(bytes: &[u8]) -> String {
    Cid::new_v1(unixfs::RAW_CODEC, Code::Sha2_256.digest(bytes)).to_string()
}
