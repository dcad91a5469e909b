//! Durable, transactional record of balances, the journal, payouts, and
//! deposit watermarks.
//!
//! All operations affecting a user serialize behind a per-user async lock;
//! the SQLite transaction beneath commits balance updates and their journal
//! entry atomically. Reads outside a transaction observe committed state
//! only.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tigerbank_types::{
    BalanceSnapshot, Bucket, Chain, ConversionLeg, Currency, EngineError, JournalEntry,
    JournalKind, Payout, PayoutState, Result, SystemSnapshot,
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// System account holding funds reserved for in-flight payouts.
pub const SYSTEM_INFLIGHT: &str = "inflight";
/// System account accumulating conversion liquidity contributions.
pub const SYSTEM_LIQUIDITY: &str = "liquidity";
/// House counter-party account funding bet wins. May go negative.
pub const SYSTEM_HOUSE: &str = "house";

pub struct LedgerStore {
    conn: Mutex<Connection>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LedgerStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// In-memory store, used by tests and local runs.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn user_lock(&self, user: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` inside a serializable transaction over one user's state.
    ///
    /// Multiple users must be locked in lexicographic order; callers that
    /// ever need a cross-user transaction go through [`Self::transaction_multi`].
    pub async fn transaction<T, F>(&self, user: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerTx<'_>) -> Result<T>,
    {
        self.transaction_multi(&[user], user, f).await
    }

    /// Like [`Self::transaction`] but locks several users (in lexicographic
    /// order, so concurrent multi-user transactions cannot deadlock).
    /// Journal snapshots attribute touched cells to `actor`.
    pub async fn transaction_multi<T, F>(&self, users: &[&str], actor: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerTx<'_>) -> Result<T>,
    {
        let mut ordered: Vec<&str> = users.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        let handles: Vec<_> = ordered.iter().map(|user| self.user_lock(user)).collect();
        let mut guards = Vec::with_capacity(handles.len());
        for handle in &handles {
            guards.push(handle.lock().await);
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(store_err)?;
        let mut ledger_tx = LedgerTx {
            tx,
            actor: actor.to_string(),
            touched: BTreeMap::new(),
            system_touched: BTreeMap::new(),
            journal_seq: None,
            now_ms: crate::now_ms(),
        };
        let out = f(&mut ledger_tx)?;
        debug_assert!(
            (ledger_tx.touched.is_empty() && ledger_tx.system_touched.is_empty())
                || ledger_tx.journal_seq.is_some(),
            "balance mutation without a journal entry"
        );
        ledger_tx.tx.commit().map_err(store_err)?;
        Ok(out)
    }

    /// All committed balances for a user. Missing cells are absent (zero).
    pub async fn balances(&self, user: &str) -> Result<BTreeMap<Currency, BTreeMap<Bucket, Decimal>>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT currency, bucket, quantity FROM accounts WHERE user_id = ?")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![user], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(store_err)?;
        let mut out: BTreeMap<Currency, BTreeMap<Bucket, Decimal>> = BTreeMap::new();
        for row in rows {
            let (currency, bucket, quantity) = row.map_err(store_err)?;
            let currency = parse_currency(&currency)?;
            let bucket = parse_bucket(&bucket)?;
            out.entry(currency)
                .or_default()
                .insert(bucket, parse_quantity(&quantity)?);
        }
        Ok(out)
    }

    /// Whether the ledger has ever recorded activity for (user, currency).
    /// Account rows are created lazily on first reference, so existence is
    /// the activity marker.
    pub async fn has_activity(&self, user: &str, currency: Currency) -> Result<bool> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE user_id = ? AND currency = ?)",
            params![user, currency.symbol()],
            |row| row.get(0),
        )
        .map_err(store_err)
    }

    pub async fn system_balance(&self, name: &str, currency: Currency) -> Result<Decimal> {
        let conn = self.conn.lock().await;
        let quantity: Option<String> = conn
            .query_row(
                "SELECT quantity FROM system_accounts WHERE name = ? AND currency = ?",
                params![name, currency.symbol()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        match quantity {
            Some(text) => parse_quantity(&text),
            None => Ok(Decimal::ZERO),
        }
    }

    pub async fn payout(&self, id: Uuid) -> Result<Option<Payout>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{PAYOUT_SELECT} WHERE id = ?"),
            params![id.to_string()],
            payout_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    pub async fn payout_by_external_id(&self, external_id: &str) -> Result<Option<Payout>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{PAYOUT_SELECT} WHERE external_id = ?"),
            params![external_id],
            payout_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    pub async fn payouts_in_state(&self, state: PayoutState) -> Result<Vec<Payout>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "{PAYOUT_SELECT} WHERE state = ? ORDER BY created_at_ms ASC"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![state.name()], payout_from_row)
            .map_err(store_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(store_err)?);
        }
        Ok(out)
    }

    /// Journal entries for one actor, in sequence order.
    pub async fn journal_for(&self, actor: &str) -> Result<Vec<JournalEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT seq, timestamp_ms, actor, kind, before_json, after_json, \
                 system_before_json, system_after_json, conversion_json, external_ref \
                 FROM journal WHERE actor = ? ORDER BY seq ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![actor], journal_row)
            .map_err(store_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(journal_from_parts(row.map_err(store_err)?)?);
        }
        Ok(out)
    }

    /// Highest committed journal sequence number (0 when empty).
    pub async fn journal_head(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM journal", [], |row| {
            row.get(0)
        })
        .map_err(store_err)
    }

    pub async fn bind_address(&self, user: &str, chain: Chain, address: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO addresses (user_id, chain, address) VALUES (?, ?, ?) \
             ON CONFLICT(user_id, chain) DO UPDATE SET address = excluded.address",
            params![user, chain.name(), address],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn bound_address(&self, user: &str, chain: Chain) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT address FROM addresses WHERE user_id = ? AND chain = ?",
            params![user, chain.name()],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err)
    }

    /// Every (user, chain, address) binding, for the deposit sweep.
    pub async fn address_bindings(&self) -> Result<Vec<(String, Chain, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT user_id, chain, address FROM addresses ORDER BY user_id, chain")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(store_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (user, chain, address) = row.map_err(store_err)?;
            let chain = Chain::from_name(&chain)
                .ok_or_else(|| EngineError::unavailable(format!("corrupt chain {chain:?}")))?;
            out.push((user, chain, address));
        }
        Ok(out)
    }
}

/// One open ledger transaction. Balance mutations accumulate touched-cell
/// snapshots; [`LedgerTx::append_journal`] turns them into the journal entry
/// that commits with them.
pub struct LedgerTx<'conn> {
    tx: Transaction<'conn>,
    actor: String,
    touched: BTreeMap<(Bucket, Currency), CellTouch>,
    system_touched: BTreeMap<(String, Currency), CellTouch>,
    journal_seq: Option<u64>,
    now_ms: u64,
}

struct CellTouch {
    before: Decimal,
    after: Decimal,
}

impl LedgerTx<'_> {
    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Current quantity of a (bucket, currency) cell for the actor,
    /// including uncommitted changes within this transaction.
    pub fn balance(&mut self, bucket: Bucket, currency: Currency) -> Result<Decimal> {
        if let Some(touch) = self.touched.get(&(bucket, currency)) {
            return Ok(touch.after);
        }
        self.load_cell(bucket, currency)
    }

    fn load_cell(&self, bucket: Bucket, currency: Currency) -> Result<Decimal> {
        let quantity: Option<String> = self
            .tx
            .query_row(
                "SELECT quantity FROM accounts WHERE user_id = ? AND currency = ? AND bucket = ?",
                params![self.actor, currency.symbol(), bucket.name()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        match quantity {
            Some(text) => parse_quantity(&text),
            None => Ok(Decimal::ZERO),
        }
    }

    pub fn credit(&mut self, bucket: Bucket, currency: Currency, quantity: Decimal) -> Result<()> {
        let current = self.balance(bucket, currency)?;
        self.set_cell(bucket, currency, current + quantity)
    }

    pub fn debit(&mut self, bucket: Bucket, currency: Currency, quantity: Decimal) -> Result<()> {
        let current = self.balance(bucket, currency)?;
        if current < quantity {
            return Err(EngineError::InsufficientBalance {
                currency,
                bucket,
                requested: quantity,
                available: current,
            });
        }
        self.set_cell(bucket, currency, current - quantity)
    }

    fn set_cell(&mut self, bucket: Bucket, currency: Currency, quantity: Decimal) -> Result<()> {
        let before = match self.touched.get(&(bucket, currency)) {
            Some(touch) => touch.before,
            None => self.load_cell(bucket, currency)?,
        };
        self.tx
            .execute(
                "INSERT INTO accounts (user_id, currency, bucket, quantity, version) \
                 VALUES (?, ?, ?, ?, 1) \
                 ON CONFLICT(user_id, currency, bucket) DO UPDATE \
                 SET quantity = excluded.quantity, version = accounts.version + 1",
                params![
                    self.actor,
                    currency.symbol(),
                    bucket.name(),
                    quantity.to_string()
                ],
            )
            .map_err(store_err)?;
        self.touched.insert(
            (bucket, currency),
            CellTouch {
                before,
                after: quantity,
            },
        );
        Ok(())
    }

    pub fn system_balance(&self, name: &str, currency: Currency) -> Result<Decimal> {
        if let Some(touch) = self.system_touched.get(&(name.to_string(), currency)) {
            return Ok(touch.after);
        }
        self.load_system_cell(name, currency)
    }

    fn load_system_cell(&self, name: &str, currency: Currency) -> Result<Decimal> {
        let quantity: Option<String> = self
            .tx
            .query_row(
                "SELECT quantity FROM system_accounts WHERE name = ? AND currency = ?",
                params![name, currency.symbol()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        match quantity {
            Some(text) => parse_quantity(&text),
            None => Ok(Decimal::ZERO),
        }
    }

    pub fn system_credit(
        &mut self,
        name: &str,
        currency: Currency,
        quantity: Decimal,
    ) -> Result<()> {
        let current = self.system_balance(name, currency)?;
        self.system_set(name, currency, current + quantity)
    }

    /// Checked debit; fails when the system account would go negative.
    /// Used for the in-flight account, which only holds reserved funds.
    pub fn system_debit(
        &mut self,
        name: &str,
        currency: Currency,
        quantity: Decimal,
    ) -> Result<()> {
        let current = self.system_balance(name, currency)?;
        if current < quantity {
            return Err(EngineError::unavailable(format!(
                "system account {name} underflow for {currency}"
            )));
        }
        self.system_set(name, currency, current - quantity)
    }

    /// Signed adjustment with no floor. The house account legitimately goes
    /// negative as win liabilities accrue.
    pub fn system_adjust(&mut self, name: &str, currency: Currency, delta: Decimal) -> Result<()> {
        let current = self.system_balance(name, currency)?;
        self.system_set(name, currency, current + delta)
    }

    fn system_set(&mut self, name: &str, currency: Currency, quantity: Decimal) -> Result<()> {
        let key = (name.to_string(), currency);
        let before = match self.system_touched.get(&key) {
            Some(touch) => touch.before,
            None => self.load_system_cell(name, currency)?,
        };
        self.tx
            .execute(
                "INSERT INTO system_accounts (name, currency, quantity) VALUES (?, ?, ?) \
                 ON CONFLICT(name, currency) DO UPDATE SET quantity = excluded.quantity",
                params![name, currency.symbol(), quantity.to_string()],
            )
            .map_err(store_err)?;
        self.system_touched.insert(
            key,
            CellTouch {
                before,
                after: quantity,
            },
        );
        Ok(())
    }

    /// Append the journal entry describing this transaction's balance
    /// mutations. Sequence numbers are dense: max committed + 1.
    pub fn append_journal(
        &mut self,
        kind: JournalKind,
        conversion: Option<&ConversionLeg>,
        external_ref: Option<&str>,
    ) -> Result<u64> {
        let seq = self
            .tx
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM journal", [], |row| {
                row.get::<_, u64>(0)
            })
            .map_err(store_err)?
            + 1;
        let (before, after) = self.snapshots();
        let (system_before, system_after) = self.system_snapshots();
        let before_json = snapshot_json(&before)?;
        let after_json = snapshot_json(&after)?;
        let system_before_json = system_json(&system_before)?;
        let system_after_json = system_json(&system_after)?;
        let conversion_json = match conversion {
            Some(leg) => Some(
                serde_json::to_string(leg)
                    .map_err(|err| EngineError::unavailable(format!("encode conversion: {err}")))?,
            ),
            None => None,
        };
        self.tx
            .execute(
                "INSERT INTO journal (seq, timestamp_ms, actor, kind, before_json, after_json, \
                 system_before_json, system_after_json, conversion_json, external_ref) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    seq,
                    self.now_ms,
                    self.actor,
                    kind.name(),
                    before_json,
                    after_json,
                    system_before_json,
                    system_after_json,
                    conversion_json,
                    external_ref
                ],
            )
            .map_err(store_err)?;
        self.journal_seq = Some(seq);
        Ok(seq)
    }

    fn snapshots(&self) -> (BalanceSnapshot, BalanceSnapshot) {
        let mut before = BalanceSnapshot::new();
        let mut after = BalanceSnapshot::new();
        for (&cell, touch) in &self.touched {
            before.insert(cell, touch.before);
            after.insert(cell, touch.after);
        }
        (before, after)
    }

    fn system_snapshots(&self) -> (SystemSnapshot, SystemSnapshot) {
        let mut before = SystemSnapshot::new();
        let mut after = SystemSnapshot::new();
        for (cell, touch) in &self.system_touched {
            before.insert(cell.clone(), touch.before);
            after.insert(cell.clone(), touch.after);
        }
        (before, after)
    }

    pub fn insert_payout(&self, payout: &Payout) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO payouts (id, user_id, currency, quantity, destination, \
                 source_bucket, external_id, chain_tx_hash, state, attempts, created_at_ms, \
                 updated_at_ms, terminal_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    payout.id.to_string(),
                    payout.user,
                    payout.currency.symbol(),
                    payout.quantity.to_string(),
                    payout.destination,
                    payout.source_bucket.name(),
                    payout.external_id,
                    payout.chain_tx_hash,
                    payout.state.name(),
                    payout.attempts,
                    payout.created_at_ms,
                    payout.updated_at_ms,
                    payout.terminal_at_ms
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn payout(&self, id: Uuid) -> Result<Option<Payout>> {
        self.tx
            .query_row(
                &format!("{PAYOUT_SELECT} WHERE id = ?"),
                params![id.to_string()],
                payout_from_row,
            )
            .optional()
            .map_err(store_err)
    }

    pub fn update_payout(&self, payout: &Payout) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "UPDATE payouts SET external_id = ?, chain_tx_hash = ?, state = ?, attempts = ?, \
                 updated_at_ms = ?, terminal_at_ms = ? WHERE id = ?",
                params![
                    payout.external_id,
                    payout.chain_tx_hash,
                    payout.state.name(),
                    payout.attempts,
                    payout.updated_at_ms,
                    payout.terminal_at_ms,
                    payout.id.to_string()
                ],
            )
            .map_err(store_err)?;
        if changed != 1 {
            return Err(EngineError::unavailable(format!(
                "payout {} missing on update",
                payout.id
            )));
        }
        Ok(())
    }

    /// Last credited (amount, at_ms) watermark for the actor and currency.
    pub fn watermark(&self, currency: Currency) -> Result<Option<(Decimal, u64)>> {
        let row: Option<(String, u64)> = self
            .tx
            .query_row(
                "SELECT last_credited_amount, last_credited_at_ms FROM deposit_watermarks \
                 WHERE user_id = ? AND currency = ?",
                params![self.actor, currency.symbol()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;
        match row {
            Some((amount, at_ms)) => Ok(Some((parse_quantity(&amount)?, at_ms))),
            None => Ok(None),
        }
    }

    pub fn set_watermark(&self, currency: Currency, amount: Decimal, at_ms: u64) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO deposit_watermarks (user_id, currency, last_credited_amount, \
                 last_credited_at_ms) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(user_id, currency) DO UPDATE \
                 SET last_credited_amount = excluded.last_credited_amount, \
                     last_credited_at_ms = excluded.last_credited_at_ms",
                params![self.actor, currency.symbol(), amount.to_string(), at_ms],
            )
            .map_err(store_err)?;
        Ok(())
    }
}

const PAYOUT_SELECT: &str = "SELECT id, user_id, currency, quantity, destination, source_bucket, \
     external_id, chain_tx_hash, state, attempts, created_at_ms, updated_at_ms, terminal_at_ms \
     FROM payouts";

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS accounts (
             user_id TEXT NOT NULL,
             currency TEXT NOT NULL,
             bucket TEXT NOT NULL,
             quantity TEXT NOT NULL,
             version INTEGER NOT NULL DEFAULT 0,
             PRIMARY KEY (user_id, currency, bucket)
         );
         CREATE TABLE IF NOT EXISTS system_accounts (
             name TEXT NOT NULL,
             currency TEXT NOT NULL,
             quantity TEXT NOT NULL,
             PRIMARY KEY (name, currency)
         );
         CREATE TABLE IF NOT EXISTS journal (
             seq INTEGER PRIMARY KEY,
             timestamp_ms INTEGER NOT NULL,
             actor TEXT NOT NULL,
             kind TEXT NOT NULL,
             before_json TEXT NOT NULL,
             after_json TEXT NOT NULL,
             system_before_json TEXT NOT NULL,
             system_after_json TEXT NOT NULL,
             conversion_json TEXT,
             external_ref TEXT
         );
         CREATE INDEX IF NOT EXISTS journal_actor ON journal(actor);
         CREATE TABLE IF NOT EXISTS payouts (
             id TEXT PRIMARY KEY,
             user_id TEXT NOT NULL,
             currency TEXT NOT NULL,
             quantity TEXT NOT NULL,
             destination TEXT NOT NULL,
             source_bucket TEXT NOT NULL,
             external_id TEXT,
             chain_tx_hash TEXT,
             state TEXT NOT NULL,
             attempts INTEGER NOT NULL DEFAULT 0,
             created_at_ms INTEGER NOT NULL,
             updated_at_ms INTEGER NOT NULL,
             terminal_at_ms INTEGER
         );
         CREATE INDEX IF NOT EXISTS payouts_state ON payouts(state);
         CREATE INDEX IF NOT EXISTS payouts_external ON payouts(external_id);
         CREATE TABLE IF NOT EXISTS deposit_watermarks (
             user_id TEXT NOT NULL,
             currency TEXT NOT NULL,
             last_credited_amount TEXT NOT NULL,
             last_credited_at_ms INTEGER NOT NULL,
             PRIMARY KEY (user_id, currency)
         );
         CREATE TABLE IF NOT EXISTS addresses (
             user_id TEXT NOT NULL,
             chain TEXT NOT NULL,
             address TEXT NOT NULL,
             PRIMARY KEY (user_id, chain)
         );",
    )?;
    Ok(())
}

fn store_err(err: rusqlite::Error) -> EngineError {
    EngineError::unavailable(format!("ledger store: {err}"))
}

fn parse_quantity(text: &str) -> Result<Decimal> {
    Decimal::from_str(text)
        .map_err(|err| EngineError::unavailable(format!("corrupt quantity {text:?}: {err}")))
}

fn parse_currency(symbol: &str) -> Result<Currency> {
    Currency::from_symbol(symbol)
        .ok_or_else(|| EngineError::unavailable(format!("corrupt currency {symbol:?}")))
}

fn parse_bucket(name: &str) -> Result<Bucket> {
    Bucket::from_name(name)
        .ok_or_else(|| EngineError::unavailable(format!("corrupt bucket {name:?}")))
}

fn snapshot_json(snapshot: &BalanceSnapshot) -> Result<String> {
    #[derive(serde::Serialize)]
    struct Wrapper<'a>(
        #[serde(with = "tigerbank_types::balance::snapshot_serde")] &'a BalanceSnapshot,
    );
    serde_json::to_string(&Wrapper(snapshot))
        .map_err(|err| EngineError::unavailable(format!("encode snapshot: {err}")))
}

fn snapshot_from_json(json: &str) -> Result<BalanceSnapshot> {
    #[derive(serde::Deserialize)]
    struct Wrapper(
        #[serde(with = "tigerbank_types::balance::snapshot_serde")] BalanceSnapshot,
    );
    let wrapper: Wrapper = serde_json::from_str(json)
        .map_err(|err| EngineError::unavailable(format!("decode snapshot: {err}")))?;
    Ok(wrapper.0)
}

fn system_json(snapshot: &SystemSnapshot) -> Result<String> {
    #[derive(serde::Serialize)]
    struct Wrapper<'a>(
        #[serde(with = "tigerbank_types::balance::system_serde")] &'a SystemSnapshot,
    );
    serde_json::to_string(&Wrapper(snapshot))
        .map_err(|err| EngineError::unavailable(format!("encode system snapshot: {err}")))
}

fn system_from_json(json: &str) -> Result<SystemSnapshot> {
    #[derive(serde::Deserialize)]
    struct Wrapper(
        #[serde(with = "tigerbank_types::balance::system_serde")] SystemSnapshot,
    );
    let wrapper: Wrapper = serde_json::from_str(json)
        .map_err(|err| EngineError::unavailable(format!("decode system snapshot: {err}")))?;
    Ok(wrapper.0)
}

type JournalParts = (
    u64,
    u64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn journal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn journal_from_parts(parts: JournalParts) -> Result<JournalEntry> {
    let (
        seq,
        timestamp_ms,
        actor,
        kind,
        before_json,
        after_json,
        system_before_json,
        system_after_json,
        conversion_json,
        external_ref,
    ) = parts;
    let kind = JournalKind::from_name(&kind)
        .ok_or_else(|| EngineError::unavailable(format!("corrupt journal kind {kind:?}")))?;
    let conversion = match conversion_json {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|err| EngineError::unavailable(format!("decode conversion: {err}")))?,
        ),
        None => None,
    };
    Ok(JournalEntry {
        seq,
        timestamp_ms,
        actor,
        kind,
        before: snapshot_from_json(&before_json)?,
        after: snapshot_from_json(&after_json)?,
        system_before: system_from_json(&system_before_json)?,
        system_after: system_from_json(&system_after_json)?,
        conversion,
        external_ref,
    })
}

fn payout_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payout> {
    let id: String = row.get(0)?;
    let currency: String = row.get(2)?;
    let quantity: String = row.get(3)?;
    let source_bucket: String = row.get(5)?;
    let state: String = row.get(8)?;
    Ok(Payout {
        id: Uuid::parse_str(&id).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
        })?,
        user: row.get(1)?,
        currency: Currency::from_symbol(&currency).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(2, "currency".into(), rusqlite::types::Type::Text)
        })?,
        quantity: Decimal::from_str(&quantity).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
        })?,
        destination: row.get(4)?,
        source_bucket: Bucket::from_name(&source_bucket).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(5, "bucket".into(), rusqlite::types::Type::Text)
        })?,
        external_id: row.get(6)?,
        chain_tx_hash: row.get(7)?,
        state: PayoutState::from_name(&state).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(8, "state".into(), rusqlite::types::Type::Text)
        })?,
        attempts: row.get(9)?,
        created_at_ms: row.get(10)?,
        updated_at_ms: row.get(11)?,
        terminal_at_ms: row.get(12)?,
    })
}
