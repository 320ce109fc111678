//! Locator-based sync protocol.
//!
//! One request/response per stream: the client writes a CBOR
//! `ShareLocatorReq`, half-closes its write side, and reads the response
//! until EOF. The server clamps the request, asks the installed handler
//! (backed by the sharechain's `shares_after`), writes the response, and
//! closes. Both directions run under a single 30-second deadline, and any
//! decode or read error simply closes the stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::messages::{
    decode_locator_req, decode_locator_resp, encode_locator_req, encode_locator_resp,
    ShareLocatorReq, ShareLocatorResp, WireError,
};

/// Protocol id. Version 2.0.0 is locator-based and incompatible with the
/// old batch sync.
pub const SYNC_PROTOCOL_ID: &str = "/p2pool/sync/2.0.0";

/// Server-side cap on shares per response.
pub const MAX_SYNC_BATCH_SIZE: u64 = 100;

/// Server-side cap on locator entries considered.
pub const MAX_LOCATOR_COUNT: usize = 64;

/// Cap on a single sync message.
pub const MAX_SYNC_MSG_SIZE: u64 = 1024 * 1024;

/// End-to-end stream deadline.
pub const SYNC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("sync stream deadline exceeded")]
    Timeout,
}

/// Serves locator requests; wired to the sharechain engine.
pub type SyncHandler = Arc<dyn Fn(ShareLocatorReq) -> ShareLocatorResp + Send + Sync>;

/// Handle one inbound sync stream. Errors are logged and swallowed; the
/// stream just closes.
pub async fn serve_sync_stream<S>(stream: S, handler: SyncHandler)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::time::timeout(SYNC_STREAM_TIMEOUT, serve_inner(stream, handler)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "sync stream closed with error"),
        Err(_) => debug!("sync stream deadline exceeded"),
    }
}

async fn serve_inner<S>(mut stream: S, handler: SyncHandler) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut data = Vec::new();
    (&mut stream)
        .take(MAX_SYNC_MSG_SIZE)
        .read_to_end(&mut data)
        .await?;

    let mut req = decode_locator_req(&data)?;

    if req.max_count > MAX_SYNC_BATCH_SIZE {
        req.max_count = MAX_SYNC_BATCH_SIZE;
    }
    if req.locators.len() > MAX_LOCATOR_COUNT {
        req.locators.truncate(MAX_LOCATOR_COUNT);
    }

    let resp = handler(req);
    let payload = encode_locator_resp(&resp)?;
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Issue a locator request over a fresh stream to a peer and wait for the
/// full response.
pub async fn request_locator<S>(
    mut stream: S,
    locators: Vec<[u8; 32]>,
    max_count: u64,
) -> Result<ShareLocatorResp, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(SYNC_STREAM_TIMEOUT, async move {
        let req = ShareLocatorReq {
            locators,
            max_count,
        };
        let payload = encode_locator_req(&req)?;
        stream.write_all(&payload).await?;
        // Half-close to tell the server the request is complete.
        stream.shutdown().await?;

        let mut data = Vec::new();
        (&mut stream)
            .take(MAX_SYNC_MSG_SIZE)
            .read_to_end(&mut data)
            .await?;
        Ok(decode_locator_resp(&data)?)
    })
    .await
    .map_err(|_| SyncError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageType, ShareMsg};
    use std::sync::Mutex;

    fn canned_shares() -> Vec<ShareMsg> {
        let mut second = ShareMsg {
            share_version: 1,
            version: 536870912,
            timestamp: 1_700_000_030,
            bits: 0x1d00ffff,
            nonce: 200,
            miner_address: "tb1qtest2".to_string(),
            ..Default::default()
        };
        second.prev_share_hash[0] = 0xaa;

        vec![
            ShareMsg {
                share_version: 1,
                version: 536870912,
                timestamp: 1_700_000_000,
                bits: 0x1d00ffff,
                nonce: 100,
                miner_address: "tb1qtest1".to_string(),
                ..Default::default()
            },
            second,
        ]
    }

    /// Run a server over one end of a duplex pipe and a client over the
    /// other.
    async fn round_trip(
        handler: SyncHandler,
        locators: Vec<[u8; 32]>,
        max_count: u64,
    ) -> ShareLocatorResp {
        let (client_side, server_side) = tokio::io::duplex(MAX_SYNC_MSG_SIZE as usize);
        let server = tokio::spawn(serve_sync_stream(server_side, handler));
        let resp = request_locator(client_side, locators, max_count)
            .await
            .unwrap();
        server.await.unwrap();
        resp
    }

    #[tokio::test]
    async fn test_share_round_trip() {
        let shares = canned_shares();
        let handler: SyncHandler = {
            let shares = shares.clone();
            Arc::new(move |_req| ShareLocatorResp {
                shares: shares.clone(),
                more: false,
            })
        };

        let resp = round_trip(handler, Vec::new(), 100).await;

        assert_eq!(resp.shares.len(), 2);
        assert_eq!(resp.shares[0].miner_address, "tb1qtest1");
        assert_eq!(resp.shares[1].miner_address, "tb1qtest2");
        assert_eq!(resp.shares[1].prev_share_hash[0], 0xaa);
        assert!(!resp.more);
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let handler: SyncHandler = Arc::new(|_req| ShareLocatorResp::default());
        let resp = round_trip(handler, Vec::new(), 100).await;
        assert!(resp.shares.is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_clamped() {
        let observed = Arc::new(Mutex::new(0u64));
        let handler: SyncHandler = {
            let observed = Arc::clone(&observed);
            Arc::new(move |req: ShareLocatorReq| {
                *observed.lock().unwrap() = req.max_count;
                ShareLocatorResp::default()
            })
        };

        round_trip(handler, Vec::new(), 500).await;
        assert_eq!(*observed.lock().unwrap(), MAX_SYNC_BATCH_SIZE);
    }

    #[tokio::test]
    async fn test_locator_list_clamped() {
        let observed = Arc::new(Mutex::new(0usize));
        let handler: SyncHandler = {
            let observed = Arc::clone(&observed);
            Arc::new(move |req: ShareLocatorReq| {
                *observed.lock().unwrap() = req.locators.len();
                ShareLocatorResp::default()
            })
        };

        let locators = vec![[0x11; 32]; MAX_LOCATOR_COUNT + 10];
        round_trip(handler, locators, 10).await;
        assert_eq!(*observed.lock().unwrap(), MAX_LOCATOR_COUNT);
    }

    #[tokio::test]
    async fn test_locator_fork_point() {
        // Server chain A→B→C→D keyed by synthetic hashes.
        let hash = |b: u8| {
            let mut h = [0u8; 32];
            h[0] = b;
            h
        };
        let mk = |name: &str, prev: [u8; 32]| ShareMsg {
            share_version: 1,
            miner_address: name.to_string(),
            prev_share_hash: prev,
            ..Default::default()
        };

        let order = [hash(1), hash(2), hash(3), hash(4)];
        let by_hash = vec![
            (hash(1), mk("A", [0u8; 32])),
            (hash(2), mk("B", hash(1))),
            (hash(3), mk("C", hash(2))),
            (hash(4), mk("D", hash(3))),
        ];

        let handler: SyncHandler = Arc::new(move |req: ShareLocatorReq| {
            let fork = req
                .locators
                .iter()
                .find_map(|loc| order.iter().position(|h| h == loc));
            let start = fork.map(|i| i + 1).unwrap_or(0);
            ShareLocatorResp {
                shares: order[start..]
                    .iter()
                    .map(|h| by_hash.iter().find(|(k, _)| k == h).unwrap().1.clone())
                    .collect(),
                more: false,
            }
        });

        // Locator [B] yields [C, D].
        let resp = round_trip(handler, vec![hash(2)], 100).await;
        assert_eq!(resp.shares.len(), 2);
        assert_eq!(resp.shares[0].miner_address, "C");
        assert_eq!(resp.shares[1].miner_address, "D");
    }

    #[tokio::test]
    async fn test_garbage_request_closes_stream() {
        let handler: SyncHandler = Arc::new(|_req| ShareLocatorResp::default());
        let (mut client_side, server_side) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve_sync_stream(server_side, handler));

        client_side.write_all(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();
        client_side.shutdown().await.unwrap();

        // No response: read hits EOF.
        let mut data = Vec::new();
        client_side.read_to_end(&mut data).await.unwrap();
        assert!(data.is_empty());
        server.await.unwrap();

        // A legacy-typed message on the sync stream is also rejected.
        let legacy = crate::messages::encode_share_request(&crate::messages::ShareRequest {
            start_hash: [0u8; 32],
            count: 5,
        })
        .unwrap();
        assert!(matches!(
            decode_locator_req(&legacy),
            Err(WireError::UnexpectedType {
                expected: MessageType::LocatorReq,
                ..
            })
        ));
    }
}
