//! Reading the CAR archives carried in firehose commit frames.

use std::collections::BTreeMap;

use bytes::Bytes;
use cid::Cid;
use iroh_car::CarReader;
use n0_future::stream::StreamExt;
use tern_common::cbor::{self, CborValue, CodecError};

use crate::error::StreamError;

/// Blocks of an in-memory CAR archive, keyed by CID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarBlocks {
    pub roots: Vec<Cid>,
    pub blocks: BTreeMap<Cid, Bytes>,
}

impl CarBlocks {
    /// First root; for a commit frame this is the commit object
    pub fn root(&self) -> Option<&Cid> {
        self.roots.first()
    }

    pub fn get(&self, cid: &Cid) -> Option<&Bytes> {
        self.blocks.get(cid)
    }

    /// Decode the block stored under `cid`, if present.
    pub fn decode(&self, cid: &Cid) -> Option<Result<CborValue, CodecError>> {
        self.get(cid).map(|block| cbor::decode(block))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Parse CAR bytes into roots and a block map.
pub async fn parse_car_bytes(data: &[u8]) -> Result<CarBlocks, StreamError> {
    let reader = CarReader::new(data).await.map_err(StreamError::decode)?;
    let roots = reader.header().roots().to_vec();

    let mut blocks = BTreeMap::new();
    let stream = reader.stream();
    n0_future::pin!(stream);

    while let Some(result) = stream.next().await {
        let (cid, data) = result.map_err(StreamError::decode)?;
        blocks.insert(cid, Bytes::from(data));
    }

    Ok(CarBlocks { roots, blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use iroh_car::{CarHeader, CarWriter};
    use tern_common::cbor::CborMap;
    use tokio::io::AsyncWriteExt;

    fn make_cid(block: &[u8]) -> Cid {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(block);
        Cid::new_v1(0x71, multihash::Multihash::wrap(0x12, &hash).unwrap())
    }

    async fn make_car(roots: Vec<Cid>, blocks: Vec<(Cid, Vec<u8>)>) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = CarWriter::new(CarHeader::new_v1(roots), &mut buf);
        for (cid, data) in blocks {
            writer.write(cid, data).await.unwrap();
        }
        writer.finish().await.unwrap();
        buf.flush().await.unwrap();
        buf
    }

    #[tokio::test]
    async fn reads_roots_and_blocks() {
        let record = cbor::encode(&CborValue::Map(CborMap::from_iter([(
            "text",
            CborValue::from("hi"),
        )])))
        .unwrap();
        let commit = cbor::encode(&CborValue::from("commit")).unwrap();
        let (record_cid, commit_cid) = (make_cid(&record), make_cid(&commit));

        let car = make_car(
            vec![commit_cid],
            vec![(commit_cid, commit), (record_cid, record)],
        )
        .await;
        let parsed = parse_car_bytes(&car).await.unwrap();

        assert_eq!(parsed.root(), Some(&commit_cid));
        assert_eq!(parsed.len(), 2);
        let decoded = parsed.decode(&record_cid).unwrap().unwrap();
        assert_eq!(decoded.get("text").and_then(CborValue::as_str), Some("hi"));
        assert!(parsed.decode(&make_cid(b"absent")).is_none());
    }

    #[tokio::test]
    async fn truncated_archive_is_a_decode_error() {
        let block = b"\x01\x02\x03".to_vec();
        let cid = make_cid(&block);
        let car = make_car(vec![cid], vec![(cid, block)]).await;

        let err = parse_car_bytes(&car[..car.len() - 2]).await.unwrap_err();
        assert_eq!(err.kind(), &crate::error::StreamErrorKind::Decode);
    }
}
