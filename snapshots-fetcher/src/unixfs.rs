//! Rebuilds the root of a UnixFS file DAG, the encoding `Qm...` and `bafybei...` content
//! addresses are computed over.
//!
//! Files are split into fixed size chunks which become the leaves of a balanced tree. A
//! single chunk is its own root.
use cid::{Cid, Version};
use multihash_codetable::{Code, MultihashDigest};
use prost::{
    Message,
    encoding::{WireType, encode_key, encode_varint},
};

/// Multicodec of raw binary content.
pub(crate) const RAW_CODEC: u64 = 0x55;
/// Multicodec of protobuf merkledag nodes.
pub(crate) const DAG_PB_CODEC: u64 = 0x70;

/// Default chunk size of the fixed size chunker.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
/// Maximum number of links of an intermediate node.
pub(crate) const DEFAULT_DEGREE: usize = 174;

const FILE_TYPE: i32 = 2;

/// How the chunks of a file are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Leaves {
    /// Chunks are stored as is, with the raw codec.
    Raw,
    /// Chunks are wrapped in a UnixFS file node.
    Pb,
}

#[derive(Clone, PartialEq, Message)]
struct Data {
    #[prost(int32, required, tag = "1")]
    r#type: i32,
    #[prost(bytes = "vec", optional, tag = "2")]
    data: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "3")]
    filesize: Option<u64>,
    #[prost(uint64, repeated, packed = "false", tag = "4")]
    blocksizes: Vec<u64>,
}

#[derive(Clone, PartialEq, Message)]
struct PbLink {
    #[prost(bytes = "vec", optional, tag = "1")]
    hash: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    name: Option<String>,
    #[prost(uint64, optional, tag = "3")]
    tsize: Option<u64>,
}

/// A node of the tree as seen by its parent.
#[derive(Debug, Clone, PartialEq)]
struct Node {
    cid: Cid,
    /// Encoded size of the node and everything below it.
    tsize: u64,
    /// Size of the file content below the node.
    filesize: u64,
}

/// Computes the root of the UnixFS file DAG of `bytes` with the default layout.
pub(crate) fn file_root(
    bytes: &[u8],
    version: Version,
    leaves: Leaves,
) -> Result<Cid, cid::Error> {
    file_root_with(bytes, version, leaves, DEFAULT_CHUNK_SIZE, DEFAULT_DEGREE)
}

fn file_root_with(
    bytes: &[u8],
    version: Version,
    leaves: Leaves,
    chunk_size: usize,
    degree: usize,
) -> Result<Cid, cid::Error> {
    let mut level = if bytes.is_empty() {
        vec![leaf(bytes, version, leaves)?]
    } else {
        bytes
            .chunks(chunk_size)
            .map(|chunk| leaf(chunk, version, leaves))
            .collect::<Result<Vec<_>, _>>()?
    };
    if level.len() == 1 {
        return Ok(level.remove(0).cid);
    }
    while level.len() > 1 {
        level = level
            .chunks(degree)
            .map(|children| parent(children, version))
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(level.remove(0).cid)
}

fn leaf(chunk: &[u8], version: Version, leaves: Leaves) -> Result<Node, cid::Error> {
    let filesize = chunk.len() as u64;
    if leaves == Leaves::Raw && version == Version::V1 {
        return Ok(Node {
            cid: Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(chunk)),
            tsize: filesize,
            filesize,
        });
    }
    let data = Data {
        r#type: FILE_TYPE,
        data: (!chunk.is_empty()).then(|| chunk.to_vec()),
        filesize: Some(filesize),
        blocksizes: Vec::new(),
    };
    let block = encode_node(&[], &data);
    Ok(Node {
        cid: pb_cid(version, &block)?,
        tsize: block.len() as u64,
        filesize,
    })
}

fn parent(children: &[Node], version: Version) -> Result<Node, cid::Error> {
    let links: Vec<PbLink> = children
        .iter()
        .map(|child| PbLink {
            hash: Some(child.cid.to_bytes()),
            name: Some(String::new()),
            tsize: Some(child.tsize),
        })
        .collect();
    let data = Data {
        r#type: FILE_TYPE,
        data: None,
        filesize: Some(children.iter().map(|child| child.filesize).sum()),
        blocksizes: children.iter().map(|child| child.filesize).collect(),
    };
    let block = encode_node(&links, &data);
    Ok(Node {
        cid: pb_cid(version, &block)?,
        tsize: block.len() as u64 + children.iter().map(|child| child.tsize).sum::<u64>(),
        filesize: data.filesize.unwrap_or_default(),
    })
}

/// Encodes a merkledag node.
///
/// The canonical form puts the links (tag 2) before the data (tag 1), so the node is
/// written field by field instead of through a derived message.
fn encode_node(links: &[PbLink], data: &Data) -> Vec<u8> {
    let mut buf = Vec::new();
    for link in links {
        let link = link.encode_to_vec();
        encode_key(2, WireType::LengthDelimited, &mut buf);
        encode_varint(link.len() as u64, &mut buf);
        buf.extend_from_slice(&link);
    }
    let data = data.encode_to_vec();
    encode_key(1, WireType::LengthDelimited, &mut buf);
    encode_varint(data.len() as u64, &mut buf);
    buf.extend_from_slice(&data);
    buf
}

fn pb_cid(version: Version, block: &[u8]) -> Result<Cid, cid::Error> {
    Cid::new(version, DAG_PB_CODEC, Code::Sha2_256.digest(block))
}
