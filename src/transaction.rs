use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{DbError, Result};
use crate::events::{Corkable, EventBus};
use crate::results::ResultSet;
use crate::types::Params;

/// Event fired after `BEGIN`, with the link's thread id as payload.
pub const EVENT_BEGIN: &str = "transaction.begin";
/// Event fired after `COMMIT` and the post-commit callbacks.
pub const EVENT_COMMIT: &str = "transaction.commit";
/// Event fired after `ROLLBACK`.
pub const EVENT_ROLLBACK: &str = "transaction.rollback";

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

pub(crate) type Callback<'c> = Box<dyn FnOnce(&mut Connection) -> Result<()> + 'c>;

/// Statements scoped between `BEGIN` and `COMMIT`/`ROLLBACK` on one
/// connection.
///
/// Callbacks queued with [`Transaction::callback`] run in order after a
/// successful commit and are dropped on rollback. Dropping a transaction
/// that is still active rolls it back.
pub struct Transaction<'c> {
    connection: &'c mut Connection,
    state: TransactionState,
    callbacks: Vec<Callback<'c>>,
    events: Arc<EventBus<u64>>,
    deferred: Vec<Arc<dyn Corkable>>,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(connection: &'c mut Connection) -> Self {
        Self {
            connection,
            state: TransactionState::Pending,
            callbacks: Vec::new(),
            events: Arc::new(EventBus::new()),
            deferred: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &*self.connection
    }

    /// Lifecycle events for this transaction.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus<u64>> {
        &self.events
    }

    /// # Errors
    /// `DbError::State` unless pending; any error from `BEGIN`.
    pub fn begin(&mut self) -> Result<()> {
        if self.state != TransactionState::Pending {
            return Err(DbError::state(format!(
                "cannot begin a transaction in state {:?}",
                self.state
            )));
        }
        self.connection.execute("BEGIN", ())?;
        self.state = TransactionState::Active;
        tracing::debug!(thread_id = self.thread_id(), "transaction begun");
        self.events.trigger(EVENT_BEGIN, self.thread_id())
    }

    /// Run a statement inside the transaction.
    ///
    /// # Errors
    /// `DbError::State` unless active; any statement error.
    pub fn execute<P: Into<Params>>(&mut self, sql: &str, params: P) -> Result<ResultSet> {
        if self.state != TransactionState::Active {
            return Err(DbError::state(format!(
                "cannot execute in a transaction in state {:?}",
                self.state
            )));
        }
        self.connection.execute(sql, params)
    }

    /// Queue `callback` to run after commit.
    ///
    /// # Errors
    /// `DbError::State` once the transaction has finished.
    pub fn callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Connection) -> Result<()> + 'c,
    {
        self.ensure_open("queue a callback on")?;
        self.queue_callback(Box::new(callback));
        Ok(())
    }

    pub(crate) fn queue_callback(&mut self, callback: Callback<'c>) {
        self.callbacks.push(callback);
    }

    /// Hold back `bus` deliveries until this transaction finishes: replayed
    /// on commit, dropped on rollback.
    ///
    /// # Errors
    /// `DbError::State` once the transaction has finished.
    pub fn defer_events(&mut self, bus: Arc<dyn Corkable>) -> Result<()> {
        self.ensure_open("defer events on")?;
        bus.cork();
        self.deferred.push(bus);
        Ok(())
    }

    /// Commit, then run queued callbacks in order.
    ///
    /// The commit stands even when a callback fails; the first failure is
    /// returned and later callbacks are skipped.
    ///
    /// # Errors
    /// `DbError::State` unless active; the `COMMIT` error; the first
    /// callback or event error.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {}
            TransactionState::Pending => {
                return Err(DbError::state("cannot commit a transaction that has not begun"));
            }
            finished => {
                return Err(DbError::state(format!(
                    "cannot commit a transaction in state {finished:?}"
                )));
            }
        }
        self.connection.execute("COMMIT", ())?;
        self.state = TransactionState::Committed;
        tracing::debug!(thread_id = self.thread_id(), callbacks = self.callbacks.len(), "transaction committed");

        let callbacks = self.run_callbacks();
        let events = self.finish_events(true);
        callbacks.and(events)
    }

    /// Roll back and drop queued callbacks. A pending transaction is
    /// discarded without touching the server.
    ///
    /// # Errors
    /// `DbError::State` once finished; the `ROLLBACK` error.
    pub fn rollback(&mut self) -> Result<()> {
        let issued = match self.state {
            TransactionState::Pending => Ok(()),
            TransactionState::Active => self.connection.execute("ROLLBACK", ()).map(|_| ()),
            finished => {
                return Err(DbError::state(format!(
                    "cannot roll back a transaction in state {finished:?}"
                )));
            }
        };
        let was_active = self.state == TransactionState::Active;
        self.state = TransactionState::RolledBack;
        self.callbacks.clear();
        tracing::debug!(thread_id = self.thread_id(), "transaction rolled back");

        let events = if was_active {
            self.finish_events(false)
        } else {
            self.release_deferred(false)
        };
        issued.and(events)
    }

    /// Begin if needed, run `body`, then commit on `Ok` or roll back on
    /// `Err`. The body's error is returned unchanged.
    ///
    /// # Errors
    /// The body's error, or any begin/commit error.
    pub fn run<T, F>(mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        if self.state == TransactionState::Pending {
            self.begin()?;
        }
        match body(&mut self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if self.state == TransactionState::Active {
                    if let Err(rollback_err) = self.rollback() {
                        tracing::warn!(error = %rollback_err, "rollback after failed body also failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn ensure_open(&self, action: &str) -> Result<()> {
        if self.state.is_finished() {
            return Err(DbError::state(format!(
                "cannot {action} a transaction in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn thread_id(&self) -> u64 {
        self.connection.thread_id().unwrap_or_default()
    }

    fn run_callbacks(&mut self) -> Result<()> {
        for callback in std::mem::take(&mut self.callbacks) {
            callback(&mut *self.connection)?;
        }
        Ok(())
    }

    fn release_deferred(&mut self, committed: bool) -> Result<()> {
        let mut first_err = None;
        for bus in self.deferred.drain(..) {
            if !committed {
                bus.discard();
            }
            if let Err(err) = bus.uncork() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn finish_events(&mut self, committed: bool) -> Result<()> {
        let released = self.release_deferred(committed);
        let name = if committed { EVENT_COMMIT } else { EVENT_ROLLBACK };
        let fired = self.events.trigger(name, self.thread_id());
        released.and(fired)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        match self.state {
            TransactionState::Active => {
                if let Err(err) = self.rollback() {
                    tracing::warn!(error = %err, "rollback of dropped transaction failed");
                }
            }
            TransactionState::Pending => {
                if let Err(err) = self.release_deferred(false) {
                    tracing::warn!(error = %err, "releasing deferred events of dropped transaction failed");
                }
            }
            TransactionState::Committed | TransactionState::RolledBack => {}
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("callbacks", &self.callbacks.len())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::DataSource;
    use crate::test_utils::{Response, ScriptedDriver};

    fn connection(driver: &ScriptedDriver) -> Connection {
        Connection::new(DataSource::default(), Arc::new(driver.clone()))
    }

    #[test]
    fn commit_runs_callbacks_in_order() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let order = Mutex::new(Vec::new());
        {
            let mut tx = conn.transaction();
            tx.callback(|_| {
                order.lock().unwrap().push("first");
                Ok(())
            })?;
            tx.begin()?;
            tx.execute("INSERT INTO t VALUES (1)", ())?;
            tx.callback(|conn: &mut Connection| {
                conn.execute("INSERT INTO audit VALUES (1)", ())?;
                order.lock().unwrap().push("second");
                Ok(())
            })?;
            tx.commit()?;
            assert_eq!(tx.state(), TransactionState::Committed);
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(
            driver.statements(),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT", "INSERT INTO audit VALUES (1)"]
        );
        Ok(())
    }

    #[test]
    fn rollback_discards_callbacks() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let ran = Mutex::new(false);
        let mut tx = conn.transaction();
        tx.begin()?;
        tx.callback(|_| {
            *ran.lock().unwrap() = true;
            Ok(())
        })?;
        tx.rollback()?;
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(matches!(tx.commit(), Err(DbError::State(_))));
        drop(tx);
        assert!(!*ran.lock().unwrap());
        assert_eq!(driver.statements(), vec!["BEGIN", "ROLLBACK"]);
        Ok(())
    }

    #[test]
    fn illegal_transitions_are_state_errors() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let mut tx = conn.transaction();
        assert!(matches!(tx.commit(), Err(DbError::State(_))));
        assert!(matches!(tx.execute("SELECT 1", ()), Err(DbError::State(_))));
        tx.begin()?;
        assert!(matches!(tx.begin(), Err(DbError::State(_))));
        tx.commit()?;
        assert!(matches!(tx.commit(), Err(DbError::State(_))));
        assert!(matches!(tx.rollback(), Err(DbError::State(_))));
        assert!(matches!(tx.callback(|_| Ok(())), Err(DbError::State(_))));
        Ok(())
    }

    #[test]
    fn pending_rollback_issues_nothing() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let mut tx = conn.transaction();
        tx.rollback()?;
        drop(tx);
        assert!(driver.statements().is_empty());
        Ok(())
    }

    #[test]
    fn failing_callback_is_surfaced_after_commit() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let later = Mutex::new(false);
        let mut tx = conn.transaction();
        tx.begin()?;
        tx.callback(|_| Err(DbError::state("cache refresh failed")))?;
        tx.callback(|_| {
            *later.lock().unwrap() = true;
            Ok(())
        })?;
        assert!(matches!(tx.commit(), Err(DbError::State(_))));
        assert_eq!(tx.state(), TransactionState::Committed);
        drop(tx);
        assert!(!*later.lock().unwrap());
        Ok(())
    }

    #[test]
    fn dropping_an_active_transaction_rolls_back() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        {
            let mut tx = conn.transaction();
            tx.begin()?;
            tx.execute("UPDATE t SET x = 1", ())?;
        }
        assert_eq!(driver.statements(), vec!["BEGIN", "UPDATE t SET x = 1", "ROLLBACK"]);
        Ok(())
    }

    #[test]
    fn run_commits_on_ok_and_rolls_back_on_err() -> Result<()> {
        let driver = ScriptedDriver::new();
        driver.on("SELECT 1", Response::rows(&["one"], vec![vec![1.into()]]));
        let mut conn = connection(&driver);

        let value = conn.transaction().run(|tx| {
            tx.execute("SELECT 1", ())?.scalar(0usize)
        })?;
        assert_eq!(value, Some(1.into()));

        let result: Result<()> = conn
            .transaction()
            .run(|_| Err(DbError::database(1062, "Duplicate entry")));
        assert!(matches!(result, Err(DbError::Database { code: 1062, .. })));
        assert_eq!(
            driver.statements(),
            vec!["BEGIN", "SELECT 1", "COMMIT", "BEGIN", "ROLLBACK"]
        );
        Ok(())
    }

    #[test]
    fn lifecycle_events_fire_with_thread_id() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut tx = conn.transaction();
        let sink = Arc::clone(&seen);
        tx.events().on(crate::events::WILDCARD, move |name: &str, id: &u64| {
            sink.lock().unwrap().push(format!("{name}@{id}"));
            Ok(())
        });
        tx.begin()?;
        tx.commit()?;
        drop(tx);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["transaction.begin@1", "transaction.commit@1"]
        );
        Ok(())
    }

    #[test]
    fn deferred_bus_flushes_on_commit_and_drops_on_rollback() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(EventBus::<&'static str>::new());
        let sink = Arc::clone(&delivered);
        bus.on("saved", move |_: &str, what: &&'static str| {
            sink.lock().unwrap().push(*what);
            Ok(())
        });

        let mut tx = conn.transaction();
        tx.defer_events(bus.clone())?;
        tx.begin()?;
        bus.trigger("saved", "kept")?;
        assert!(delivered.lock().unwrap().is_empty());
        tx.commit()?;
        drop(tx);

        let mut tx = conn.transaction();
        tx.begin()?;
        tx.defer_events(bus.clone())?;
        bus.trigger("saved", "dropped")?;
        tx.rollback()?;
        drop(tx);

        assert_eq!(*delivered.lock().unwrap(), vec!["kept"]);
        assert!(!bus.is_corked());
        Ok(())
    }

    /// Records the calls a transaction makes and refuses to uncork.
    struct StuckBus(Mutex<Vec<&'static str>>);

    impl Corkable for StuckBus {
        fn cork(&self) {
            self.0.lock().unwrap().push("cork");
        }

        fn uncork(&self) -> Result<()> {
            self.0.lock().unwrap().push("uncork");
            Err(DbError::state("replay failed"))
        }

        fn discard(&self) {
            self.0.lock().unwrap().push("discard");
        }
    }

    #[test]
    fn dropping_a_pending_transaction_releases_deferred_buses() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        let bus = Arc::new(StuckBus(Mutex::new(Vec::new())));
        {
            let mut tx = conn.transaction();
            tx.defer_events(bus.clone())?;
        }
        assert_eq!(*bus.0.lock().unwrap(), vec!["cork", "discard", "uncork"]);
        assert!(driver.statements().is_empty());
        Ok(())
    }
}
