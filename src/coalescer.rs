use crate::errors::{GatewayError, Result};
use crate::facilitator::Facilitator;
use crate::metrics;
use crate::models::{PaymentEnvelope, PaymentRequirements, SettleItem, SettleReceipt};
use futures::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub sweep_interval: Duration,
    pub stale_age: Duration,
    pub flush_retry_delay: Duration,
}

impl CoalescerConfig {
    pub fn from_config(cfg: &crate::config::BatchConfig) -> Self {
        Self {
            batch_size: cfg.size,
            batch_timeout: Duration::from_millis(cfg.timeout_ms),
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
            stale_age: Duration::from_secs(cfg.stale_age_secs),
            flush_retry_delay: Duration::from_millis(cfg.flush_retry_delay_ms),
        }
    }
}

pub type SettleResult = Result<SettleReceipt>;

struct Inner {
    /// Insertion order is the settlement order within a flush.
    queue: Vec<SettleItem>,
    waiters: HashMap<Uuid, oneshot::Sender<SettleResult>>,
    processing: bool,
    timer: Option<JoinHandle<()>>,
    closing: bool,
}

/// Gathers individual settlement requests into facilitator batches.
/// A flush fires when the queue reaches `batch_size` or when the batch
/// timer expires, re-verifies the drained items, submits the survivors
/// to `/settle/batch`, and demultiplexes the positional results back to
/// the waiting callers.
pub struct SettlementCoalescer {
    inner: Mutex<Inner>,
    facilitator: Arc<dyn Facilitator>,
    cfg: CoalescerConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<SettlementCoalescer>,
}

impl SettlementCoalescer {
    pub fn new(facilitator: Arc<dyn Facilitator>, cfg: CoalescerConfig) -> Arc<Self> {
        let coalescer = Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                waiters: HashMap::new(),
                processing: false,
                timer: None,
                closing: false,
            }),
            facilitator,
            cfg,
            sweeper: Mutex::new(None),
            weak: weak.clone(),
        });

        let weak = Arc::downgrade(&coalescer);
        let interval = coalescer.cfg.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(coalescer) = weak.upgrade() else { break };
                coalescer.sweep_stale();
            }
        });
        *coalescer.sweeper.lock().expect("sweeper lock") = Some(handle);

        coalescer
    }

    /// Insert one item and hand back the completion channel. Fails fast
    /// once shutdown has begun; a closing coalescer never accepts work.
    pub fn submit(
        &self,
        payment: PaymentEnvelope,
        requirements: PaymentRequirements,
    ) -> Result<oneshot::Receiver<SettleResult>> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let mut inner = self.inner.lock().expect("coalescer lock");
        if inner.closing {
            return Err(GatewayError::ShuttingDown);
        }
        inner.queue.push(SettleItem {
            request_id,
            payment,
            requirements,
            enqueued_at: Instant::now(),
        });
        inner.waiters.insert(request_id, tx);

        if inner.queue.len() >= self.cfg.batch_size {
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            if !inner.processing {
                self.spawn_flush(None);
            }
        } else if inner.timer.is_none() && !inner.processing {
            if let Some(me) = self.weak.upgrade() {
                let delay = self.cfg.batch_timeout;
                inner.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    me.run_flush().await;
                }));
            }
        }

        Ok(rx)
    }

    /// Block the caller until its settlement resolves.
    pub async fn enqueue(
        &self,
        payment: PaymentEnvelope,
        requirements: PaymentRequirements,
    ) -> SettleResult {
        let rx = self.submit(payment, requirements)?;
        rx.await
            .map_err(|_| GatewayError::Internal("settlement result channel closed".to_string()))?
    }

    fn spawn_flush(&self, delay: Option<Duration>) {
        let Some(me) = self.weak.upgrade() else { return };
        tokio::spawn(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            me.run_flush().await;
        });
    }

    /// One flush: drain up to `batch_size` in insertion order, settle,
    /// then reschedule if work remains. Reentrancy-guarded by
    /// `processing`; a concurrent call returns without touching the
    /// queue. Boxed so follow-up flushes can be spawned from inside.
    fn run_flush(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let batch: Vec<SettleItem> = {
                let mut inner = self.inner.lock().expect("coalescer lock");
                if inner.processing {
                    return;
                }
                inner.processing = true;
                if let Some(timer) = inner.timer.take() {
                    timer.abort();
                }
                let n = inner.queue.len().min(self.cfg.batch_size);
                inner.queue.drain(..n).collect()
            };

            if !batch.is_empty() {
                self.settle_drained(batch).await;
            }

            let reschedule = {
                let mut inner = self.inner.lock().expect("coalescer lock");
                inner.processing = false;
                !inner.queue.is_empty() && !inner.closing
            };
            if reschedule {
                self.spawn_flush(Some(self.cfg.flush_retry_delay));
            }
        })
    }

    async fn settle_drained(&self, batch: Vec<SettleItem>) {
        metrics::SETTLE_BATCH_SIZE.observe(batch.len() as f64);
        debug!("Flushing settlement batch of {}", batch.len());

        // Terms can go stale between enqueue and flush; re-verify all
        // drained items in parallel and complete the invalid ones now.
        let verifications = join_all(
            batch
                .iter()
                .map(|item| self.facilitator.verify(&item.payment, &item.requirements)),
        )
        .await;

        let mut valid: Vec<SettleItem> = Vec::with_capacity(batch.len());
        for (item, verdict) in batch.into_iter().zip(verifications) {
            match verdict {
                Ok(v) if v.is_valid => valid.push(item),
                Ok(v) => {
                    let reason = v
                        .reason
                        .or(v.message)
                        .unwrap_or_else(|| "invalid_payment".to_string());
                    self.complete(
                        item.request_id,
                        Err(GatewayError::PaymentInvalid {
                            reason: format!("Verification failed: {}", reason),
                        }),
                    );
                }
                Err(e) => self.complete(item.request_id, Err(e)),
            }
        }

        if valid.is_empty() {
            return;
        }

        let payloads: Vec<(PaymentEnvelope, PaymentRequirements)> = valid
            .iter()
            .map(|item| (item.payment.clone(), item.requirements.clone()))
            .collect();

        match self.facilitator.settle_batch(&payloads).await {
            Ok(response) => {
                for (position, item) in valid.iter().enumerate() {
                    let outcome = self.demux_result(&response, position, item);
                    self.complete(item.request_id, outcome);
                }
            }
            Err(e) => {
                warn!("Batch settle failed, failing {} items: {}", valid.len(), e);
                let message = e.to_string();
                for item in &valid {
                    self.complete(
                        item.request_id,
                        Err(GatewayError::FacilitatorTransport(message.clone())),
                    );
                }
            }
        }
    }

    fn demux_result(
        &self,
        response: &crate::facilitator::BatchSettleResponse,
        position: usize,
        item: &SettleItem,
    ) -> SettleResult {
        let Some(result) = response.results.iter().find(|r| r.index == position) else {
            metrics::SETTLEMENTS_TOTAL
                .with_label_values(&["missing"])
                .inc();
            return Err(GatewayError::Internal(format!(
                "facilitator returned no result at index {}",
                position
            )));
        };

        if result.success {
            match &result.transaction {
                Some(transaction) => {
                    metrics::SETTLEMENTS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    Ok(SettleReceipt {
                        success: true,
                        transaction: transaction.clone(),
                        network: item.payment.network.clone(),
                        nonce: result.nonce.clone(),
                        payer: result.payer.clone(),
                    })
                }
                None => {
                    metrics::SETTLEMENTS_TOTAL
                        .with_label_values(&["failure"])
                        .inc();
                    Err(GatewayError::Internal(
                        "settlement succeeded without a transaction hash".to_string(),
                    ))
                }
            }
        } else {
            metrics::SETTLEMENTS_TOTAL
                .with_label_values(&["failure"])
                .inc();
            match &result.error {
                Some(reason) => Err(GatewayError::from_settle_reason(reason)),
                // Declined without a reason: a payment-level refusal.
                None => Err(GatewayError::PaymentInvalid {
                    reason: "settlement_declined".to_string(),
                }),
            }
        }
    }

    fn complete(&self, request_id: Uuid, result: SettleResult) {
        let waiter = {
            self.inner
                .lock()
                .expect("coalescer lock")
                .waiters
                .remove(&request_id)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(result);
        }
    }

    /// Remove items past the stale age and complete them with a timeout
    /// error. Items mid-flush are out of the queue and unaffected.
    fn sweep_stale(&self) {
        let stale_ids: Vec<Uuid> = {
            let mut inner = self.inner.lock().expect("coalescer lock");
            let threshold = self.cfg.stale_age;
            let (stale, fresh): (Vec<SettleItem>, Vec<SettleItem>) = inner
                .queue
                .drain(..)
                .partition(|item| item.enqueued_at.elapsed() > threshold);
            inner.queue = fresh;
            stale.into_iter().map(|item| item.request_id).collect()
        };
        for id in stale_ids {
            warn!("Settlement item {} went stale in queue", id);
            self.complete(id, Err(GatewayError::CoalescerTimeout));
        }
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().expect("coalescer lock").queue.len()
    }

    /// Stop accepting work, flush once, and fail whatever is left with a
    /// shutdown error so no caller is abandoned mid-await.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().expect("coalescer lock");
            inner.closing = true;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
        }
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock").take() {
            handle.abort();
        }

        if let Some(me) = self.weak.upgrade() {
            me.run_flush().await;
        }

        let leftovers: Vec<Uuid> = {
            let mut inner = self.inner.lock().expect("coalescer lock");
            inner.queue.drain(..).map(|item| item.request_id).collect()
        };
        for id in leftovers {
            self.complete(id, Err(GatewayError::ShuttingDown));
        }
        info!("Settlement coalescer shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facilitator::MockFacilitator;
    use crate::models::{AssetDomain, ExactPayload, TransferAuthorization};
    use std::sync::atomic::Ordering;

    fn test_cfg(batch_size: usize, timeout_ms: u64) -> CoalescerConfig {
        CoalescerConfig {
            batch_size,
            batch_timeout: Duration::from_millis(timeout_ms),
            sweep_interval: Duration::from_secs(60),
            stale_age: Duration::from_secs(120),
            flush_retry_delay: Duration::from_millis(10),
        }
    }

    fn payment(nonce: &str) -> PaymentEnvelope {
        PaymentEnvelope {
            x402_version: 1,
            scheme: "exact".to_string(),
            network: "bsc".to_string(),
            payload: ExactPayload {
                signature: "0xsig".to_string(),
                authorization: TransferAuthorization {
                    from: "0xpayer".to_string(),
                    to: "0xtoken".to_string(),
                    value: "10000000".to_string(),
                    valid_after: "0".to_string(),
                    valid_before: "9999999999".to_string(),
                    nonce: nonce.to_string(),
                },
            },
        }
    }

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".to_string(),
            network: "bsc".to_string(),
            asset: "0xasset".to_string(),
            pay_to: "0xtoken".to_string(),
            max_amount_required: "10000000".to_string(),
            extra: AssetDomain {
                name: "USD Coin".to_string(),
                version: "2".to_string(),
            },
            max_timeout_seconds: 300,
        }
    }

    #[tokio::test]
    async fn test_first_flush_settles_prefix_in_order() {
        let facilitator = Arc::new(MockFacilitator::new());
        let coalescer = SettlementCoalescer::new(facilitator.clone(), test_cfg(10, 50));

        let receivers: Vec<_> = (0..12)
            .map(|i| {
                coalescer
                    .submit(payment(&format!("0xn{}", i)), requirements())
                    .unwrap()
            })
            .collect();

        let mut receipts = Vec::new();
        for rx in receivers {
            receipts.push(rx.await.unwrap().unwrap());
        }

        assert_eq!(receipts.len(), 12);
        // The first batch preserves enqueue order positionally: item i
        // settles at index i of the first flush.
        for (i, receipt) in receipts.iter().take(10).enumerate() {
            assert_eq!(receipt.transaction, format!("0xmock{}0xn{}", i, i));
        }
        // The overflow settles on the next flush, again in order.
        assert_eq!(receipts[10].transaction, "0xmock00xn10");
        assert_eq!(receipts[11].transaction, "0xmock10xn11");
        assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_items_split_out_of_settle_body() {
        let mut facilitator = MockFacilitator::new();
        facilitator.reject_nonces = vec!["0xn1".to_string(), "0xn3".to_string()];
        let facilitator = Arc::new(facilitator);
        let coalescer = SettlementCoalescer::new(facilitator.clone(), test_cfg(5, 50));

        let receivers: Vec<_> = (0..5)
            .map(|i| {
                coalescer
                    .submit(payment(&format!("0xn{}", i)), requirements())
                    .unwrap()
            })
            .collect();

        let mut outcomes = Vec::new();
        for rx in receivers {
            outcomes.push(rx.await.unwrap());
        }

        // The settle body carried exactly the three survivors.
        assert_eq!(facilitator.last_batch_len.load(Ordering::SeqCst), 3);

        for (i, outcome) in outcomes.iter().enumerate() {
            if i == 1 || i == 3 {
                match outcome {
                    Err(GatewayError::PaymentInvalid { reason }) => {
                        assert_eq!(reason, "Verification failed: signature_invalid");
                    }
                    other => panic!("expected verification failure, got {:?}", other),
                }
            } else {
                assert!(outcome.is_ok(), "item {} should settle", i);
            }
        }
    }

    #[tokio::test]
    async fn test_batch_post_failure_fails_every_item() {
        let mut facilitator = MockFacilitator::new();
        facilitator.fail_settle = true;
        let facilitator = Arc::new(facilitator);
        let coalescer = SettlementCoalescer::new(facilitator, test_cfg(3, 50));

        let receivers: Vec<_> = (0..3)
            .map(|i| {
                coalescer
                    .submit(payment(&format!("0xn{}", i)), requirements())
                    .unwrap()
            })
            .collect();

        for rx in receivers {
            match rx.await.unwrap() {
                Err(GatewayError::FacilitatorTransport(_)) => {}
                other => panic!("expected transport failure, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_timer_flushes_partial_batch() {
        let facilitator = Arc::new(MockFacilitator::new());
        let coalescer = SettlementCoalescer::new(facilitator.clone(), test_cfg(10, 30));

        let rx = coalescer.submit(payment("0xn0"), requirements()).unwrap();
        let receipt = rx.await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work_and_drains() {
        let facilitator = Arc::new(MockFacilitator::new());
        let coalescer = SettlementCoalescer::new(facilitator, test_cfg(10, 60_000));

        let rx_a = coalescer.submit(payment("0xn0"), requirements()).unwrap();
        let rx_b = coalescer.submit(payment("0xn1"), requirements()).unwrap();

        coalescer.shutdown().await;

        // Queued items settled through the final flush.
        assert!(rx_a.await.unwrap().is_ok());
        assert!(rx_b.await.unwrap().is_ok());

        // New work is refused once closing.
        match coalescer.submit(payment("0xn2"), requirements()) {
            Err(GatewayError::ShuttingDown) => {}
            other => panic!("expected shutdown refusal, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_stale_sweep_times_out_stuck_items() {
        let facilitator = Arc::new(MockFacilitator::new());
        let cfg = CoalescerConfig {
            batch_size: 100,
            batch_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_millis(20),
            stale_age: Duration::from_millis(30),
            flush_retry_delay: Duration::from_millis(10),
        };
        let coalescer = SettlementCoalescer::new(facilitator, cfg);

        let rx = coalescer.submit(payment("0xn0"), requirements()).unwrap();
        match tokio::time::timeout(Duration::from_secs(2), rx).await {
            Ok(Ok(Err(GatewayError::CoalescerTimeout))) => {}
            other => panic!("expected stale timeout, got {:?}", other),
        }
    }
}
