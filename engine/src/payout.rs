//! Payout router: reserve, submit, and settle withdrawals through the
//! external custodial processor.
//!
//! Each payout walks CREATED -> RESERVED -> SUBMITTED -> terminal. Funds
//! are debited into the in-flight system account when the payout is
//! reserved, and either drained (confirmed) or returned (refunded) when it
//! reaches a terminal state. Submission is idempotent on the payout id,
//! which the processor receives as the client nonce.

use crate::store::{LedgerStore, SYSTEM_INFLIGHT};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha512;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tigerbank_types::{
    Bucket, Currency, EngineError, JournalKind, Payout, PayoutState, PayoutStatus, Result,
    WithdrawReceipt,
};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

/// Failure modes of a processor call, split by retry policy.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Connection-level failure; the request may never have arrived.
    /// Retried with the same nonce.
    #[error("transport: {0}")]
    Transport(String),
    /// The processor explicitly refused the request. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Deadline elapsed with the outcome unknown. Not retried; recovery
    /// reconciles by nonce.
    #[error("timed out")]
    Timeout,
}

/// Acknowledgement of an accepted payout submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorAck {
    pub external_id: String,
}

/// Processor-side status of a submitted payout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessorPayoutStatus {
    Pending,
    Finished { chain_tx_hash: Option<String> },
    Failed { reason: String },
}

/// The external custodial payout processor.
pub trait PayoutProcessor: Send + Sync {
    fn create_payout(
        &self,
        nonce: Uuid,
        currency: Currency,
        quantity: Decimal,
        destination: &str,
    ) -> impl Future<Output = std::result::Result<ProcessorAck, ProcessorError>> + Send;

    fn payout_status(
        &self,
        external_id: &str,
    ) -> impl Future<Output = std::result::Result<ProcessorPayoutStatus, ProcessorError>> + Send;

    /// Look up a submission by client nonce; `None` means the processor
    /// never saw it.
    fn find_by_nonce(
        &self,
        nonce: Uuid,
    ) -> impl Future<Output = std::result::Result<Option<ProcessorAck>, ProcessorError>> + Send;
}

type HmacSha512 = Hmac<Sha512>;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);

pub struct PayoutRouter<P: PayoutProcessor> {
    store: Arc<LedgerStore>,
    processor: P,
    submit_retries: u32,
    ipn_secret: String,
}

/// Webhook body delivered by the processor.
#[derive(Debug, Deserialize)]
struct IpnBody {
    id: String,
    status: String,
    #[serde(default)]
    hash: Option<String>,
}

impl<P: PayoutProcessor> PayoutRouter<P> {
    pub fn new(
        store: Arc<LedgerStore>,
        processor: P,
        submit_retries: u32,
        ipn_secret: String,
    ) -> Self {
        Self {
            store,
            processor,
            submit_retries,
            ipn_secret,
        }
    }

    /// Create a withdrawal: validate, reserve, submit.
    ///
    /// Validation failures happen before any funds move and leave no payout
    /// record; a failure record only exists once a reservation does. A transport
    /// timeout leaves the payout RESERVED and surfaces `Ambiguous`; the
    /// recovery scan settles its fate.
    pub async fn withdraw(
        &self,
        user: &str,
        currency: Currency,
        quantity: Decimal,
        destination: &str,
        bucket: Bucket,
    ) -> Result<WithdrawReceipt> {
        if quantity < currency.min_withdrawal() {
            return Err(EngineError::validation(format!(
                "minimum withdrawal for {currency} is {}, got {quantity}",
                currency.min_withdrawal()
            )));
        }
        let chain = currency.home_chain();
        if !chain.validate_address(destination) {
            return Err(EngineError::validation(format!(
                "destination {destination:?} is not a valid {chain} address"
            )));
        }

        let id = Uuid::new_v4();
        let destination = destination.to_string();
        let dest = destination.clone();
        let seq = self
            .store
            .transaction(user, move |tx| {
                tx.debit(bucket, currency, quantity)?;
                tx.system_credit(SYSTEM_INFLIGHT, currency, quantity)?;
                let now = tx.now_ms();
                tx.insert_payout(&Payout {
                    id,
                    user: tx.actor().to_string(),
                    currency,
                    quantity,
                    destination: dest,
                    source_bucket: bucket,
                    external_id: None,
                    chain_tx_hash: None,
                    state: PayoutState::Reserved,
                    attempts: 0,
                    created_at_ms: now,
                    updated_at_ms: now,
                    terminal_at_ms: None,
                })?;
                tx.append_journal(JournalKind::PayoutReserve, None, Some(&id.to_string()))
            })
            .await?;
        info!(user, %currency, %quantity, payout = %id, "payout reserved");

        let state = self.submit(id, currency, quantity, &destination).await?;
        Ok(WithdrawReceipt {
            payout_id: id,
            state,
            journal_seq: seq,
        })
    }

    /// Submit a reserved payout, retrying transport errors with exponential
    /// backoff. Every attempt reuses the payout id as nonce.
    async fn submit(
        &self,
        id: Uuid,
        currency: Currency,
        quantity: Decimal,
        destination: &str,
    ) -> Result<PayoutState> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .processor
                .create_payout(id, currency, quantity, destination)
                .await
            {
                Ok(ack) => {
                    self.mark_submitted(id, &ack.external_id, attempt).await?;
                    return Ok(PayoutState::Submitted);
                }
                Err(ProcessorError::Transport(err)) if attempt <= self.submit_retries => {
                    warn!(payout = %id, attempt, error = %err, "payout submit retrying");
                    sleep(RETRY_BACKOFF_BASE * 2u32.saturating_pow(attempt - 1)).await;
                }
                Err(ProcessorError::Transport(err)) => {
                    warn!(payout = %id, error = %err, "payout submit exhausted retries");
                    self.fail_and_refund(id, &format!("transport: {err}")).await?;
                    return Ok(PayoutState::Refunded);
                }
                Err(ProcessorError::Rejected(reason)) => {
                    warn!(payout = %id, reason = %reason, "payout rejected by processor");
                    self.fail_and_refund(id, &reason).await?;
                    return Ok(PayoutState::Refunded);
                }
                Err(ProcessorError::Timeout) => {
                    // The processor may have accepted it; leave RESERVED for
                    // the recovery scan.
                    warn!(payout = %id, "payout submit timed out");
                    return Err(EngineError::Ambiguous { payout_id: id });
                }
            }
        }
    }

    pub async fn payout_status(&self, id: Uuid) -> Result<PayoutStatus> {
        let payout = self
            .store
            .payout(id)
            .await?
            .ok_or_else(|| EngineError::validation(format!("unknown payout {id}")))?;
        Ok(PayoutStatus {
            payout_id: payout.id,
            state: payout.state,
            external_id: payout.external_id,
            chain_tx_hash: payout.chain_tx_hash,
        })
    }

    /// Handle a signed processor webhook over the raw request body.
    ///
    /// The signature is HMAC-SHA512 of the body with the shared secret,
    /// hex-encoded. Bad signatures are rejected without state change and
    /// without logging body contents.
    pub async fn handle_webhook(&self, raw_body: &[u8], signature_hex: &str) -> Result<()> {
        let mut mac = HmacSha512::new_from_slice(self.ipn_secret.as_bytes())
            .map_err(|_| EngineError::unavailable("ipn secret unusable".to_string()))?;
        mac.update(raw_body);
        let signature = hex::decode(signature_hex.trim())
            .map_err(|_| EngineError::validation("malformed webhook signature".to_string()))?;
        mac.verify_slice(&signature)
            .map_err(|_| EngineError::validation("webhook signature mismatch".to_string()))?;

        let body: IpnBody = serde_json::from_slice(raw_body)
            .map_err(|err| EngineError::validation(format!("malformed webhook body: {err}")))?;
        let payout = self
            .store
            .payout_by_external_id(&body.id)
            .await?
            .ok_or_else(|| {
                EngineError::validation(format!("webhook for unknown payout {}", body.id))
            })?;

        match body.status.as_str() {
            "finished" | "confirmed" => self.confirm(payout.id, body.hash.as_deref()).await,
            "failed" | "rejected" | "expired" => {
                self.fail_and_refund(payout.id, &body.status).await
            }
            other => {
                // Intermediate statuses carry no transition.
                info!(payout = %payout.id, status = other, "webhook status ignored");
                Ok(())
            }
        }
    }

    /// Drain the in-flight reservation; money leaves the system.
    /// No-ops when the payout is already terminal.
    async fn confirm(&self, id: Uuid, chain_tx_hash: Option<&str>) -> Result<()> {
        let hash = chain_tx_hash.map(str::to_string);
        let payout = self.require_payout(id).await?;
        self.store
            .transaction(&payout.user.clone(), move |tx| {
                let mut payout = tx
                    .payout(id)?
                    .ok_or_else(|| EngineError::unavailable(format!("payout {id} vanished")))?;
                if payout.state.is_terminal() {
                    return Ok(());
                }
                tx.system_debit(SYSTEM_INFLIGHT, payout.currency, payout.quantity)?;
                payout.state = PayoutState::Confirmed;
                payout.chain_tx_hash = hash;
                payout.updated_at_ms = tx.now_ms();
                payout.terminal_at_ms = Some(tx.now_ms());
                tx.update_payout(&payout)?;
                tx.append_journal(JournalKind::PayoutSettle, None, Some(&id.to_string()))?;
                Ok(())
            })
            .await?;
        info!(payout = %id, "payout confirmed");
        Ok(())
    }

    /// Record the failure, then return the reserved quantity to its source
    /// bucket.
    ///
    /// For SUBMITTED payouts the FAILED state commits on its own before the
    /// refund does, so a crash in between leaves a durable FAILED record the
    /// recovery scan finishes. RESERVED payouts refund directly.
    async fn fail_and_refund(&self, id: Uuid, reason: &str) -> Result<()> {
        let payout = self.require_payout(id).await?;
        self.store
            .transaction(&payout.user.clone(), move |tx| {
                let mut payout = tx
                    .payout(id)?
                    .ok_or_else(|| EngineError::unavailable(format!("payout {id} vanished")))?;
                if !payout.state.can_transition_to(PayoutState::Failed) {
                    return Ok(());
                }
                payout.state = PayoutState::Failed;
                payout.updated_at_ms = tx.now_ms();
                tx.update_payout(&payout)?;
                Ok(())
            })
            .await?;
        info!(payout = %id, reason, "payout failed");
        self.refund(id).await
    }

    /// Return the reserved quantity to its source bucket. No-ops when the
    /// payout is already terminal.
    async fn refund(&self, id: Uuid) -> Result<()> {
        let payout = self.require_payout(id).await?;
        self.store
            .transaction(&payout.user.clone(), move |tx| {
                let mut payout = tx
                    .payout(id)?
                    .ok_or_else(|| EngineError::unavailable(format!("payout {id} vanished")))?;
                if payout.state.is_terminal() {
                    return Ok(());
                }
                tx.system_debit(SYSTEM_INFLIGHT, payout.currency, payout.quantity)?;
                tx.credit(payout.source_bucket, payout.currency, payout.quantity)?;
                payout.state = PayoutState::Refunded;
                payout.updated_at_ms = tx.now_ms();
                payout.terminal_at_ms = Some(tx.now_ms());
                tx.update_payout(&payout)?;
                tx.append_journal(JournalKind::PayoutRefund, None, Some(&id.to_string()))?;
                Ok(())
            })
            .await?;
        info!(payout = %id, "payout refunded");
        Ok(())
    }

    async fn mark_submitted(&self, id: Uuid, external_id: &str, attempts: u32) -> Result<()> {
        let external_id = external_id.to_string();
        let payout = self.require_payout(id).await?;
        self.store
            .transaction(&payout.user.clone(), move |tx| {
                let mut payout = tx
                    .payout(id)?
                    .ok_or_else(|| EngineError::unavailable(format!("payout {id} vanished")))?;
                if payout.state != PayoutState::Reserved {
                    return Ok(());
                }
                payout.state = PayoutState::Submitted;
                payout.external_id = Some(external_id);
                payout.attempts = attempts;
                payout.updated_at_ms = tx.now_ms();
                tx.update_payout(&payout)?;
                Ok(())
            })
            .await
    }

    async fn require_payout(&self, id: Uuid) -> Result<Payout> {
        self.store
            .payout(id)
            .await?
            .ok_or_else(|| EngineError::validation(format!("unknown payout {id}")))
    }

    /// Startup recovery: settle the fate of payouts interrupted mid-flight.
    ///
    /// RESERVED payouts are reconciled by nonce (the processor either saw
    /// the submission or it never happened); SUBMITTED payouts are polled
    /// for a terminal status; FAILED payouts get their interrupted refund.
    pub async fn recover(&self) -> Result<u64> {
        let mut reconciled = 0u64;

        for payout in self.store.payouts_in_state(PayoutState::Reserved).await? {
            match self.processor.find_by_nonce(payout.id).await {
                Ok(Some(ack)) => {
                    info!(payout = %payout.id, "recovery: submission found by nonce");
                    self.mark_submitted(payout.id, &ack.external_id, payout.attempts.max(1))
                        .await?;
                    reconciled += 1;
                }
                Ok(None) => {
                    info!(payout = %payout.id, "recovery: never submitted, resubmitting");
                    match self
                        .submit(payout.id, payout.currency, payout.quantity, &payout.destination)
                        .await
                    {
                        Ok(_) => reconciled += 1,
                        Err(EngineError::Ambiguous { .. }) => {
                            warn!(payout = %payout.id, "recovery: resubmission ambiguous");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => {
                    warn!(payout = %payout.id, error = %err, "recovery: nonce lookup failed");
                }
            }
        }

        for payout in self.store.payouts_in_state(PayoutState::Submitted).await? {
            let external_id = match payout.external_id.as_deref() {
                Some(external_id) => external_id,
                None => continue,
            };
            match self.processor.payout_status(external_id).await {
                Ok(ProcessorPayoutStatus::Finished { chain_tx_hash }) => {
                    self.confirm(payout.id, chain_tx_hash.as_deref()).await?;
                    reconciled += 1;
                }
                Ok(ProcessorPayoutStatus::Failed { reason }) => {
                    self.fail_and_refund(payout.id, &reason).await?;
                    reconciled += 1;
                }
                Ok(ProcessorPayoutStatus::Pending) => {}
                Err(err) => {
                    warn!(payout = %payout.id, error = %err, "recovery: status poll failed");
                }
            }
        }

        for payout in self.store.payouts_in_state(PayoutState::Failed).await? {
            info!(payout = %payout.id, "recovery: completing interrupted refund");
            self.refund(payout.id).await?;
            reconciled += 1;
        }

        Ok(reconciled)
    }
}

/// HTTP payout processor client (NOWPayments-style API).
pub struct HttpPayoutProcessor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpPayoutProcessor {
    pub fn new(config: &crate::config::EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config
                .payout_processor_base_url
                .trim_end_matches('/')
                .to_string(),
            api_key: config.payout_processor_api_key.clone(),
            timeout: config.payout_submit_timeout,
        }
    }

    fn map_err(err: reqwest::Error) -> ProcessorError {
        if err.is_timeout() {
            ProcessorError::Timeout
        } else {
            ProcessorError::Transport(err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct CreatePayoutResponse {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    hash: Option<String>,
}

impl PayoutProcessor for HttpPayoutProcessor {
    async fn create_payout(
        &self,
        nonce: Uuid,
        currency: Currency,
        quantity: Decimal,
        destination: &str,
    ) -> std::result::Result<ProcessorAck, ProcessorError> {
        let body = serde_json::json!({
            "nonce": nonce.to_string(),
            "currency": currency.symbol().to_ascii_lowercase(),
            "amount": quantity.to_string(),
            "address": destination,
        });
        let response = self
            .client
            .post(format!("{}/payout", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::map_err)?;
        if response.status().is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProcessorError::Rejected(detail));
        }
        let parsed: CreatePayoutResponse = response
            .error_for_status()
            .map_err(Self::map_err)?
            .json()
            .await
            .map_err(Self::map_err)?;
        Ok(ProcessorAck {
            external_id: parsed.id,
        })
    }

    async fn payout_status(
        &self,
        external_id: &str,
    ) -> std::result::Result<ProcessorPayoutStatus, ProcessorError> {
        let response: StatusResponse = self
            .client
            .get(format!("{}/payout/{external_id}", self.base_url))
            .header("x-api-key", &self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::map_err)?
            .error_for_status()
            .map_err(Self::map_err)?
            .json()
            .await
            .map_err(Self::map_err)?;
        Ok(match response.status.as_str() {
            "finished" | "confirmed" => ProcessorPayoutStatus::Finished {
                chain_tx_hash: response.hash,
            },
            "failed" | "rejected" | "expired" => ProcessorPayoutStatus::Failed {
                reason: response.status,
            },
            _ => ProcessorPayoutStatus::Pending,
        })
    }

    async fn find_by_nonce(
        &self,
        nonce: Uuid,
    ) -> std::result::Result<Option<ProcessorAck>, ProcessorError> {
        let response = self
            .client
            .get(format!("{}/payout", self.base_url))
            .query(&[("nonce", nonce.to_string())])
            .header("x-api-key", &self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::map_err)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: CreatePayoutResponse = response
            .error_for_status()
            .map_err(Self::map_err)?
            .json()
            .await
            .map_err(Self::map_err)?;
        Ok(Some(ProcessorAck {
            external_id: parsed.id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const DOGE_ADDR: &str = "DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L";
    const SECRET: &str = "top-secret";

    /// Scripted processor: pops queued results for create calls; status and
    /// nonce lookups return whatever the test configured.
    struct ScriptedProcessor {
        create_results: Mutex<VecDeque<std::result::Result<ProcessorAck, ProcessorError>>>,
        status: Mutex<Option<ProcessorPayoutStatus>>,
        by_nonce: Mutex<Option<ProcessorAck>>,
        create_calls: Mutex<u32>,
    }

    impl ScriptedProcessor {
        fn new() -> Self {
            Self {
                create_results: Mutex::new(VecDeque::new()),
                status: Mutex::new(None),
                by_nonce: Mutex::new(None),
                create_calls: Mutex::new(0),
            }
        }

        fn push_create(&self, result: std::result::Result<ProcessorAck, ProcessorError>) {
            self.create_results.lock().unwrap().push_back(result);
        }

        fn ack(external_id: &str) -> ProcessorAck {
            ProcessorAck {
                external_id: external_id.to_string(),
            }
        }
    }

    impl PayoutProcessor for &ScriptedProcessor {
        async fn create_payout(
            &self,
            _nonce: Uuid,
            _currency: Currency,
            _quantity: Decimal,
            _destination: &str,
        ) -> std::result::Result<ProcessorAck, ProcessorError> {
            *self.create_calls.lock().unwrap() += 1;
            self.create_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ScriptedProcessor::ack("ext-default")))
        }

        async fn payout_status(
            &self,
            _external_id: &str,
        ) -> std::result::Result<ProcessorPayoutStatus, ProcessorError> {
            Ok(self
                .status
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(ProcessorPayoutStatus::Pending))
        }

        async fn find_by_nonce(
            &self,
            _nonce: Uuid,
        ) -> std::result::Result<Option<ProcessorAck>, ProcessorError> {
            Ok(self.by_nonce.lock().unwrap().clone())
        }
    }

    async fn seeded_store() -> Arc<LedgerStore> {
        let store = Arc::new(LedgerStore::open_in_memory().expect("store"));
        store
            .transaction("alice", |tx| {
                tx.credit(Bucket::Deposit, Currency::Doge, dec!(500))?;
                tx.append_journal(JournalKind::DepositCredit, None, None)?;
                Ok(())
            })
            .await
            .expect("seed");
        store
    }

    fn router<'a>(
        store: Arc<LedgerStore>,
        processor: &'a ScriptedProcessor,
    ) -> PayoutRouter<&'a ScriptedProcessor> {
        PayoutRouter::new(store, processor, 2, SECRET.to_string())
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = HmacSha512::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn below_minimum_is_rejected_before_reserve() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        let router = router(Arc::clone(&store), &processor);

        let err = router
            .withdraw("alice", Currency::Doge, dec!(5), DOGE_ADDR, Bucket::Deposit)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Doge][&Bucket::Deposit], dec!(500));
        assert_eq!(*processor.create_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_address_is_rejected_before_reserve() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        let router = router(Arc::clone(&store), &processor);

        let err = router
            .withdraw("alice", Currency::Doge, dec!(50), "not-an-address", Bucket::Deposit)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(
            store
                .system_balance(SYSTEM_INFLIGHT, Currency::Doge)
                .await
                .expect("inflight"),
            dec!(0)
        );
    }

    #[tokio::test]
    async fn withdraw_reserves_then_submits() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Ok(ScriptedProcessor::ack("ext-1")));
        let router = router(Arc::clone(&store), &processor);

        let receipt = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");
        assert_eq!(receipt.state, PayoutState::Submitted);

        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Doge][&Bucket::Deposit], dec!(400));
        assert_eq!(
            store
                .system_balance(SYSTEM_INFLIGHT, Currency::Doge)
                .await
                .expect("inflight"),
            dec!(100)
        );
        let payout = store
            .payout(receipt.payout_id)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(payout.state, PayoutState::Submitted);
        assert_eq!(payout.external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn transport_errors_are_retried_with_same_nonce() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Err(ProcessorError::Transport("reset".into())));
        processor.push_create(Err(ProcessorError::Transport("reset".into())));
        processor.push_create(Ok(ScriptedProcessor::ack("ext-2")));
        let router = router(Arc::clone(&store), &processor);

        let receipt = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");
        assert_eq!(receipt.state, PayoutState::Submitted);
        assert_eq!(*processor.create_calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn rejection_refunds_the_reservation() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Err(ProcessorError::Rejected("bad address".into())));
        let router = router(Arc::clone(&store), &processor);

        let receipt = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");
        assert_eq!(receipt.state, PayoutState::Refunded);

        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Doge][&Bucket::Deposit], dec!(500));
        assert_eq!(
            store
                .system_balance(SYSTEM_INFLIGHT, Currency::Doge)
                .await
                .expect("inflight"),
            dec!(0)
        );
        assert_eq!(*processor.create_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn timeout_leaves_reserved_and_surfaces_ambiguous() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Err(ProcessorError::Timeout));
        let router = router(Arc::clone(&store), &processor);

        let err = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .unwrap_err();
        let id = match err {
            EngineError::Ambiguous { payout_id } => payout_id,
            other => panic!("expected ambiguous, got {other:?}"),
        };
        let payout = store.payout(id).await.expect("query").expect("present");
        assert_eq!(payout.state, PayoutState::Reserved);
        assert_eq!(
            store
                .system_balance(SYSTEM_INFLIGHT, Currency::Doge)
                .await
                .expect("inflight"),
            dec!(100)
        );
    }

    #[tokio::test]
    async fn verified_webhook_confirms_and_drains_inflight() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Ok(ScriptedProcessor::ack("ext-3")));
        let router = router(Arc::clone(&store), &processor);
        let receipt = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");

        let body = br#"{"id":"ext-3","status":"finished","hash":"abc123"}"#;
        router
            .handle_webhook(body, &sign(body))
            .await
            .expect("webhook");

        let payout = store
            .payout(receipt.payout_id)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(payout.state, PayoutState::Confirmed);
        assert_eq!(payout.chain_tx_hash.as_deref(), Some("abc123"));
        assert_eq!(
            store
                .system_balance(SYSTEM_INFLIGHT, Currency::Doge)
                .await
                .expect("inflight"),
            dec!(0)
        );
        // Money left the system; the user balance stays debited.
        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Doge][&Bucket::Deposit], dec!(400));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_without_state_change() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Ok(ScriptedProcessor::ack("ext-4")));
        let router = router(Arc::clone(&store), &processor);
        let receipt = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");

        let body = br#"{"id":"ext-4","status":"finished"}"#;
        let err = router
            .handle_webhook(body, &hex::encode([0u8; 64]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let payout = store
            .payout(receipt.payout_id)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(payout.state, PayoutState::Submitted);
    }

    #[tokio::test]
    async fn repeated_webhook_is_a_no_op() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Ok(ScriptedProcessor::ack("ext-5")));
        let router = router(Arc::clone(&store), &processor);
        router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");

        let body = br#"{"id":"ext-5","status":"finished","hash":"abc"}"#;
        router.handle_webhook(body, &sign(body)).await.expect("first");
        router.handle_webhook(body, &sign(body)).await.expect("replay");

        // The in-flight account is drained exactly once.
        assert_eq!(
            store
                .system_balance(SYSTEM_INFLIGHT, Currency::Doge)
                .await
                .expect("inflight"),
            dec!(0)
        );
        let head = store.journal_head().await.expect("head");
        let body2 = br#"{"id":"ext-5","status":"finished","hash":"abc"}"#;
        router.handle_webhook(body2, &sign(body2)).await.expect("third");
        assert_eq!(store.journal_head().await.expect("head"), head);
    }

    #[tokio::test]
    async fn failed_webhook_refunds_to_source_bucket() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Ok(ScriptedProcessor::ack("ext-6")));
        let router = router(Arc::clone(&store), &processor);
        let receipt = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");

        let body = br#"{"id":"ext-6","status":"failed"}"#;
        router.handle_webhook(body, &sign(body)).await.expect("webhook");

        let payout = store
            .payout(receipt.payout_id)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(payout.state, PayoutState::Refunded);
        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Doge][&Bucket::Deposit], dec!(500));
    }

    #[tokio::test]
    async fn recovery_completes_interrupted_refund() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        let router = router(Arc::clone(&store), &processor);

        // A crash between the FAILED commit and the refund leaves this shape:
        // funds reserved in-flight, record durably FAILED.
        let id = Uuid::new_v4();
        store
            .transaction("alice", |tx| {
                tx.debit(Bucket::Deposit, Currency::Doge, dec!(100))?;
                tx.system_credit(SYSTEM_INFLIGHT, Currency::Doge, dec!(100))?;
                let now = tx.now_ms();
                tx.insert_payout(&Payout {
                    id,
                    user: "alice".into(),
                    currency: Currency::Doge,
                    quantity: dec!(100),
                    destination: DOGE_ADDR.into(),
                    source_bucket: Bucket::Deposit,
                    external_id: Some("ext-10".into()),
                    chain_tx_hash: None,
                    state: PayoutState::Failed,
                    attempts: 1,
                    created_at_ms: now,
                    updated_at_ms: now,
                    terminal_at_ms: None,
                })?;
                tx.append_journal(JournalKind::PayoutReserve, None, Some(&id.to_string()))?;
                Ok(())
            })
            .await
            .expect("interrupted state");

        let reconciled = router.recover().await.expect("recover");
        assert_eq!(reconciled, 1);

        let payout = store.payout(id).await.expect("query").expect("present");
        assert_eq!(payout.state, PayoutState::Refunded);
        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Doge][&Bucket::Deposit], dec!(500));
        assert_eq!(
            store
                .system_balance(SYSTEM_INFLIGHT, Currency::Doge)
                .await
                .expect("inflight"),
            dec!(0)
        );
    }

    #[tokio::test]
    async fn recovery_advances_reserved_found_by_nonce() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Err(ProcessorError::Timeout));
        let router = router(Arc::clone(&store), &processor);
        let err = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .unwrap_err();
        let id = match err {
            EngineError::Ambiguous { payout_id } => payout_id,
            other => panic!("expected ambiguous, got {other:?}"),
        };

        *processor.by_nonce.lock().unwrap() = Some(ScriptedProcessor::ack("ext-7"));
        let reconciled = router.recover().await.expect("recover");
        assert_eq!(reconciled, 1);

        let payout = store.payout(id).await.expect("query").expect("present");
        assert_eq!(payout.state, PayoutState::Submitted);
        assert_eq!(payout.external_id.as_deref(), Some("ext-7"));
    }

    #[tokio::test]
    async fn recovery_resubmits_reserved_unknown_to_processor() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Err(ProcessorError::Timeout));
        let router = router(Arc::clone(&store), &processor);
        router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .unwrap_err();

        processor.push_create(Ok(ScriptedProcessor::ack("ext-8")));
        let reconciled = router.recover().await.expect("recover");
        assert_eq!(reconciled, 1);

        let reserved = store
            .payouts_in_state(PayoutState::Reserved)
            .await
            .expect("reserved");
        assert!(reserved.is_empty());
    }

    #[tokio::test]
    async fn recovery_polls_submitted_to_terminal() {
        let store = seeded_store().await;
        let processor = ScriptedProcessor::new();
        processor.push_create(Ok(ScriptedProcessor::ack("ext-9")));
        let router = router(Arc::clone(&store), &processor);
        let receipt = router
            .withdraw("alice", Currency::Doge, dec!(100), DOGE_ADDR, Bucket::Deposit)
            .await
            .expect("withdraw");

        *processor.status.lock().unwrap() = Some(ProcessorPayoutStatus::Finished {
            chain_tx_hash: Some("deadbeef".into()),
        });
        let reconciled = router.recover().await.expect("recover");
        assert_eq!(reconciled, 1);

        let payout = store
            .payout(receipt.payout_id)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(payout.state, PayoutState::Confirmed);
        assert_eq!(payout.chain_tx_hash.as_deref(), Some("deadbeef"));
    }
}
