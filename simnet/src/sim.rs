//! # Simulated Nodes
//!
//! In-process stand-ins for consensus and mirror nodes. They speak the
//! client's JSON reference codec over the local transport and misbehave on
//! purpose: consensus nodes drop calls and answer BUSY at configured rates,
//! the mirror cuts streams short with the errors real proxies produce.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha384};

use ledger_client::codec::{JsonCodec, TransactionEnvelope, TransactionResponse};
use ledger_client::execution::LedgerStatus;
use ledger_client::signing::verify;
use ledger_client::subscription::{ChunkInfo, Timestamp, TopicResponse};
use ledger_client::transport::{LocalService, ResponseStream, Status, StatusCode};
use ledger_client::TopicId;

use crate::metrics::SimMetrics;

/// A seeded generator, or an entropy-seeded one.
pub fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Fault rates for one simulated consensus node.
#[derive(Debug, Clone, Copy)]
pub struct Faults {
    pub failure_rate: f64,
    pub busy_rate: f64,
    pub max_latency: Duration,
}

/// A consensus node that verifies signatures and answers with a status.
pub struct SimNode {
    name: String,
    faults: Faults,
    rng: Mutex<StdRng>,
    metrics: SimMetrics,
}

impl SimNode {
    pub fn new(name: impl Into<String>, faults: Faults, seed: u64, metrics: SimMetrics) -> Self {
        Self {
            name: name.into(),
            faults,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            metrics,
        }
    }

    fn roll(&self) -> (f64, Duration) {
        let mut rng = self.rng.lock();
        let latency_ms = self.faults.max_latency.as_millis() as u64;
        let latency = if latency_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=latency_ms))
        };
        (rng.gen::<f64>(), latency)
    }

    fn judge(&self, payload: &[u8]) -> LedgerStatus {
        let Ok(envelope) = JsonCodec.decode::<TransactionEnvelope>(payload) else {
            return LedgerStatus::InvalidTransaction;
        };
        let Ok(signed) = hex::decode(&envelope.body) else {
            return LedgerStatus::InvalidTransaction;
        };
        let valid = !envelope.signatures.is_empty()
            && envelope.signatures.iter().all(|pair| {
                match (hex::decode(&pair.public_key), hex::decode(&pair.signature)) {
                    (Ok(key), Ok(signature)) => verify(&key, &signed, &signature),
                    _ => false,
                }
            });
        if valid {
            LedgerStatus::Ok
        } else {
            LedgerStatus::InvalidSignature
        }
    }
}

#[async_trait]
impl LocalService for SimNode {
    async fn unary(&self, method: &str, payload: Bytes) -> Result<Bytes, Status> {
        let (roll, latency) = self.roll();
        tokio::time::sleep(latency).await;

        if roll < self.faults.failure_rate {
            self.metrics
                .injected_faults_total
                .with_label_values(&["unavailable"])
                .inc();
            tracing::debug!(node = %self.name, method, "dropping call");
            return Err(Status::unavailable(format!("{} dropped the call", self.name)));
        }
        let status = if roll < self.faults.failure_rate + self.faults.busy_rate {
            self.metrics.injected_faults_total.with_label_values(&["busy"]).inc();
            LedgerStatus::Busy
        } else {
            self.judge(&payload)
        };
        JsonCodec
            .encode(&TransactionResponse { status })
            .map_err(|e| Status::internal(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

/// Shape of a generated topic log.
#[derive(Debug, Clone, Copy)]
pub struct TopicLog {
    pub topic: TopicId,
    pub messages: u64,
    /// Every n-th message is chunked. Zero disables chunking.
    pub chunk_every: u64,
    pub chunks: u32,
}

impl TopicLog {
    /// Builds the stream items, one per single message and one per chunk,
    /// with strictly increasing sequence numbers and consensus timestamps
    /// and a SHA-384 running hash.
    pub fn generate(&self, start: Timestamp) -> Vec<TopicResponse> {
        let mut items = Vec::new();
        let mut running_hash = vec![0u8; 48];
        let mut sequence = 0u64;
        let mut at = start;

        for n in 1..=self.messages {
            let body = format!("message {n} on topic {}", self.topic);
            let chunked = self.chunk_every > 0 && self.chunks > 1 && n % self.chunk_every == 0;
            let pieces = if chunked {
                split(body.as_bytes(), self.chunks as usize)
            } else {
                vec![body.into_bytes()]
            };
            let total = pieces.len() as u32;
            let initial_transaction_id = format!("0.0.2@{}.{}", at.seconds, at.nanos);

            for (i, piece) in pieces.into_iter().enumerate() {
                sequence += 1;
                at = at.plus_nanos(1_000_000);
                running_hash = Sha384::new()
                    .chain_update(&running_hash)
                    .chain_update(&piece)
                    .finalize()
                    .to_vec();
                items.push(TopicResponse {
                    consensus_timestamp: at,
                    sequence_number: sequence,
                    running_hash: Bytes::from(running_hash.clone()),
                    contents: Bytes::from(piece),
                    chunk: (total > 1).then(|| ChunkInfo {
                        initial_transaction_id: initial_transaction_id.clone(),
                        number: i as u32 + 1,
                        total,
                    }),
                });
            }
        }
        items
    }
}

/// Splits `bytes` into at most `parts` non-empty pieces.
fn split(bytes: &[u8], parts: usize) -> Vec<Vec<u8>> {
    let size = bytes.len().div_ceil(parts.max(1)).max(1);
    bytes.chunks(size).map(<[u8]>::to_vec).collect()
}

/// A mirror serving one topic log, dropping the first few streams.
pub struct SimMirror {
    log: Vec<TopicResponse>,
    break_after: usize,
    breaks_left: Mutex<u32>,
    interval: Duration,
    metrics: SimMetrics,
}

impl SimMirror {
    pub fn new(
        log: Vec<TopicResponse>,
        break_after: usize,
        breaks: u32,
        interval: Duration,
        metrics: SimMetrics,
    ) -> Self {
        Self {
            log,
            break_after,
            breaks_left: Mutex::new(breaks),
            interval,
            metrics,
        }
    }

    fn take_break(&self) -> Option<u32> {
        let mut left = self.breaks_left.lock();
        if *left == 0 {
            return None;
        }
        *left -= 1;
        Some(*left)
    }
}

#[async_trait]
impl LocalService for SimMirror {
    async fn unary(&self, method: &str, _payload: Bytes) -> Result<Bytes, Status> {
        Err(Status::unimplemented(format!("{method} is streaming only")))
    }

    async fn server_streaming(
        &self,
        method: &str,
        payload: Bytes,
    ) -> Result<ResponseStream, Status> {
        let query = JsonCodec
            .decode_query(&payload)
            .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;
        tracing::debug!(
            method,
            topic = %query.topic_id,
            limit = query.limit,
            start = ?query.start_time.map(|t| t.to_string()),
            "mirror stream opened"
        );

        let limit = if query.limit == 0 { usize::MAX } else { query.limit as usize };
        let mut items: Vec<Result<Bytes, Status>> = self
            .log
            .iter()
            .filter(|r| query.start_time.map_or(true, |start| r.consensus_timestamp >= start))
            .filter(|r| query.end_time.map_or(true, |end| r.consensus_timestamp < end))
            .take(limit)
            .map(|r| JsonCodec.encode_response(r).map_err(|e| Status::internal(e.to_string())))
            .collect();

        if items.len() > self.break_after {
            if let Some(left) = self.take_break() {
                items.truncate(self.break_after);
                // Alternate between the two faults real proxies produce.
                items.push(Err(if left % 2 == 0 {
                    Status::internal("upstream connect error: RST_STREAM")
                } else {
                    Status::unavailable("mirror restarting")
                }));
            }
        }

        let metrics = self.metrics.clone();
        let interval = self.interval;
        let stream = futures::stream::iter(items).then(move |item| {
            let metrics = metrics.clone();
            async move {
                tokio::time::sleep(interval).await;
                match &item {
                    Ok(_) => metrics.stream_items_served_total.inc(),
                    Err(_) => metrics.stream_breaks_total.inc(),
                }
                item
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_client::subscription::{ChunkBuffer, TopicQuery};
    use ledger_client::codec::MirrorCodec;

    fn log() -> TopicLog {
        TopicLog {
            topic: TopicId::from_num(1001),
            messages: 8,
            chunk_every: 4,
            chunks: 3,
        }
    }

    #[test]
    fn generated_log_reassembles_into_its_messages() {
        let items = log().generate(Timestamp::new(1_700_000_000, 0));
        // Six single messages plus two messages of three chunks.
        assert_eq!(items.len(), 12);
        assert!(items
            .windows(2)
            .all(|w| w[0].consensus_timestamp < w[1].consensus_timestamp));

        let mut buffer = ChunkBuffer::new();
        let messages: Vec<_> = items.into_iter().filter_map(|i| buffer.accept(i)).collect();
        assert_eq!(messages.len(), 8);
        assert_eq!(&messages[3].contents[..], b"message 4 on topic 0.0.1001");
        assert_eq!(messages[3].chunks, 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn split_never_yields_empty_pieces() {
        assert_eq!(split(b"abcdefg", 3), vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]);
        assert_eq!(split(b"ab", 5).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mirror_breaks_then_serves_the_rest() {
        let metrics = SimMetrics::new().unwrap();
        let items = log().generate(Timestamp::new(1_700_000_000, 0));
        let mirror = SimMirror::new(items, 5, 1, Duration::from_millis(10), metrics.clone());
        let query = JsonCodec
            .encode_query(&TopicQuery::new(TopicId::from_num(1001)))
            .unwrap();

        let first: Vec<_> = mirror
            .server_streaming("subscribe", query.clone())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(first.len(), 6);
        assert!(first[5].as_ref().unwrap_err().is_stream_reset());

        let second: Vec<_> = mirror
            .server_streaming("subscribe", query)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(second.len(), 12);
        assert!(second.iter().all(Result::is_ok));
        assert_eq!(metrics.stream_breaks_total.get(), 1);
        assert_eq!(metrics.stream_items_served_total.get(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn certain_failure_drops_every_call() {
        let node = SimNode::new(
            "node-0",
            Faults {
                failure_rate: 1.0,
                busy_rate: 0.0,
                max_latency: Duration::ZERO,
            },
            7,
            SimMetrics::new().unwrap(),
        );
        let err = node.unary("submit", Bytes::new()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_is_an_invalid_transaction() {
        let node = SimNode::new(
            "node-0",
            Faults {
                failure_rate: 0.0,
                busy_rate: 0.0,
                max_latency: Duration::ZERO,
            },
            7,
            SimMetrics::new().unwrap(),
        );
        let answer = node.unary("submit", Bytes::from_static(b"junk")).await.unwrap();
        let decoded: TransactionResponse = JsonCodec.decode(&answer).unwrap();
        assert_eq!(decoded.status, LedgerStatus::InvalidTransaction);
    }
}
