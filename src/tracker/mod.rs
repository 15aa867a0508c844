//! Lifecycle tracking for sessions, statements and row cursors.
//!
//! The tracker follows the acquire/use/release protocol of the
//! connection → statement → cursor hierarchy and owns one observability scope
//! per open connection and per open cursor. Every scope it opens is stopped
//! exactly once: by the resource's own close, by a cascading close of its
//! statement or connection, or when the tracker itself is dropped.
//!
//! All registries are sharded maps. Every mutation is atomic for a single
//! identity (`remove`, `entry().or_insert_with`), so two racing closes can never
//! both take ownership of the same scope. A guard on `result_sets` may be held
//! while `connections` or `by_statement` is locked, never the other way round.

mod attributes;
mod clock;
mod scope;

use std::collections::HashSet;
use std::error::Error;
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

pub use self::attributes::{
    ConnectionDetails, ConnectionId, ConnectionSnapshot, CursorId, ResultSetSnapshot, StatementId,
};
pub use self::clock::{BoxClock, Clock, SystemClock};
pub use self::scope::{
    ObservationScope, ScopeAttribute, ScopeContext, ScopeFactory, TracingScope, TracingScopes,
};
use self::attributes::{ConnectionAttributes, ResultSetAttributes};

/// A connection whose acquisition has begun but not ended.
///
/// Owns the acquiring scope until it is handed to
/// [`ResourceTracker::on_acquire_end`]. Dropping it unfinished stops the scope.
#[must_use = "an acquisition must be finished with `on_acquire_end`"]
pub struct PendingConnection<S: ObservationScope> {
    connection_id: ConnectionId,
    scope: Option<S>,
}

impl<S: ObservationScope> PendingConnection<S> {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Run `f` inside the acquiring scope, so events it records are attributed
    /// to this acquisition.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.scope {
            Some(scope) => scope.in_scope(f),
            None => f(),
        }
    }
}

impl<S: ObservationScope> Drop for PendingConnection<S> {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            tracing::warn!(
                connection.id = %self.connection_id,
                "Connection acquisition dropped before it ended"
            );
            scope.stop(None);
        }
    }
}

impl<S: ObservationScope> fmt::Debug for PendingConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnection")
            .field("connection_id", &self.connection_id)
            .field("open", &self.scope.is_some())
            .finish()
    }
}

/// Tracks open connections and cursors and the scopes opened for them.
///
/// # Example
///
/// ```rust
/// use sql_observation::tracker::{
///     ConnectionDetails, ConnectionId, CursorId, ResourceTracker, StatementId,
/// };
///
/// let tracker = ResourceTracker::new();
/// let connection = ConnectionId::new(1);
///
/// let pending = tracker.on_acquire_begin(connection);
/// tracker.on_acquire_end(pending, Ok(ConnectionDetails::new().with_host("db.internal")));
///
/// tracker.on_cursor_advance(connection, StatementId::new(10), CursorId::new(100), true);
/// tracker.on_cursor_advance(connection, StatementId::new(10), CursorId::new(100), true);
/// assert_eq!(tracker.result_set(CursorId::new(100)).unwrap().row_count, 2);
///
/// // Closing the connection also closes the cursor still open under it.
/// tracker.on_connection_close(connection, None);
/// assert_eq!(tracker.open_result_sets(), 0);
/// ```
pub struct ResourceTracker<F: ScopeFactory = TracingScopes> {
    scopes: F,
    clock: BoxClock,
    connections: DashMap<ConnectionId, ConnectionAttributes<F::Scope>>,
    result_sets: DashMap<CursorId, ResultSetAttributes<F::Scope>>,
    by_statement: DashMap<StatementId, HashSet<CursorId>>,
}

impl ResourceTracker<TracingScopes> {
    /// Create a tracker that records scopes as `tracing` spans.
    pub fn new() -> Self {
        Self::with_scopes(TracingScopes)
    }
}

impl Default for ResourceTracker<TracingScopes> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ScopeFactory> ResourceTracker<F> {
    /// Create a tracker backed by a custom scope factory.
    pub fn with_scopes(scopes: F) -> Self {
        Self {
            scopes,
            clock: Box::new(SystemClock),
            connections: DashMap::new(),
            result_sets: DashMap::new(),
            by_statement: DashMap::new(),
        }
    }

    /// Replace the clock used for commit and rollback timestamps.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Start acquiring a connection.
    ///
    /// The scope opens immediately but the connection is not indexed until the
    /// acquisition ends successfully.
    pub fn on_acquire_begin(&self, connection_id: ConnectionId) -> PendingConnection<F::Scope> {
        let scope = self
            .scopes
            .open(&ScopeContext::Connection { connection_id });
        PendingConnection {
            connection_id,
            scope: Some(scope),
        }
    }

    /// Finish acquiring a connection.
    ///
    /// On success the connection is indexed and its scope stays open until the
    /// connection closes. On failure the scope stops right away with the error
    /// and nothing is indexed.
    pub fn on_acquire_end(
        &self,
        mut pending: PendingConnection<F::Scope>,
        outcome: Result<ConnectionDetails, &(dyn Error + 'static)>,
    ) {
        let Some(scope) = pending.scope.take() else {
            return;
        };
        let connection_id = pending.connection_id;

        match outcome {
            Ok(details) => {
                let record = ConnectionAttributes::new(connection_id, details, scope);
                if let Some(stale) = self.connections.insert(connection_id, record) {
                    tracing::debug!(
                        connection.id = %connection_id,
                        "Connection identity reused before close, releasing the previous record"
                    );
                    self.release_connection(stale, None);
                }
            }
            Err(error) => {
                tracing::debug!(
                    connection.id = %connection_id,
                    error = %error,
                    "Connection acquisition failed"
                );
                scope.stop(Some(error));
            }
        }
    }

    /// Stamp a commit on a connection.
    pub fn on_commit(&self, connection_id: ConnectionId) {
        self.stamp(connection_id, "commit", |record, now| {
            record.committed_at = Some(now);
        });
    }

    /// Stamp a rollback on a connection.
    pub fn on_rollback(&self, connection_id: ConnectionId) {
        self.stamp(connection_id, "rollback", |record, now| {
            record.rolled_back_at = Some(now);
        });
    }

    fn stamp(
        &self,
        connection_id: ConnectionId,
        event: &'static str,
        apply: impl FnOnce(&mut ConnectionAttributes<F::Scope>, DateTime<Utc>),
    ) {
        match self.connections.get_mut(&connection_id) {
            Some(mut record) => {
                apply(record.value_mut(), self.clock.now());
                record.scope.event(event);
            }
            None => {
                tracing::debug!(connection.id = %connection_id, event, "Event for untracked connection");
            }
        }
    }

    /// Close a connection, closing every cursor still open under it first.
    ///
    /// `error` is attached to the connection scope and to every cursor scope
    /// closed by the cascade.
    pub fn on_connection_close(
        &self,
        connection_id: ConnectionId,
        error: Option<&(dyn Error + 'static)>,
    ) {
        let Some((_, record)) = self.connections.remove(&connection_id) else {
            tracing::debug!(connection.id = %connection_id, "Close for untracked connection");
            return;
        };
        self.release_connection(record, error);
    }

    fn release_connection(
        &self,
        record: ConnectionAttributes<F::Scope>,
        error: Option<&(dyn Error + 'static)>,
    ) {
        for cursor_id in &record.open_result_sets {
            if let Some((_, result_set)) = self.result_sets.remove(cursor_id) {
                self.forget_statement_cursor(result_set.statement_id, *cursor_id);
                result_set.stop(error);
            }
        }
        record.scope.stop(error);
    }

    /// Record a successful advance of a cursor.
    ///
    /// The first advance that lands on a row opens the cursor's scope; later
    /// ones only count rows.
    pub fn on_cursor_advance(
        &self,
        connection_id: ConnectionId,
        statement_id: StatementId,
        cursor_id: CursorId,
        has_row: bool,
    ) {
        self.advance(connection_id, statement_id, cursor_id, has_row, false);
    }

    /// Like [`on_cursor_advance`](Self::on_cursor_advance), for the cursor over
    /// keys generated by an insert.
    pub fn on_generated_keys_advance(
        &self,
        connection_id: ConnectionId,
        statement_id: StatementId,
        cursor_id: CursorId,
        has_row: bool,
    ) {
        self.advance(connection_id, statement_id, cursor_id, has_row, true);
    }

    fn advance(
        &self,
        connection_id: ConnectionId,
        statement_id: StatementId,
        cursor_id: CursorId,
        has_row: bool,
        generated_keys: bool,
    ) {
        if !has_row {
            return;
        }

        let mut record = self.result_sets.entry(cursor_id).or_insert_with(|| {
            if let Some(mut connection) = self.connections.get_mut(&connection_id) {
                connection.open_result_sets.insert(cursor_id);
            }
            self.by_statement
                .entry(statement_id)
                .or_default()
                .insert(cursor_id);

            let scope = self.scopes.open(&ScopeContext::ResultSet {
                connection_id,
                statement_id,
                cursor_id,
                generated_keys,
            });
            ResultSetAttributes {
                cursor_id,
                statement_id,
                connection_id,
                row_count: 0,
                is_generated_keys_cursor: generated_keys,
                scope,
            }
        });
        record.row_count += 1;
    }

    /// Close a cursor.
    pub fn on_cursor_close(&self, cursor_id: CursorId, error: Option<&(dyn Error + 'static)>) {
        let Some((_, result_set)) = self.result_sets.remove(&cursor_id) else {
            tracing::trace!(cursor.id = %cursor_id, "Close for untracked cursor");
            return;
        };
        self.forget_connection_cursor(result_set.connection_id, cursor_id);
        self.forget_statement_cursor(result_set.statement_id, cursor_id);
        result_set.stop(error);
    }

    /// Close a statement, closing every cursor still open under it.
    pub fn on_statement_close(
        &self,
        statement_id: StatementId,
        error: Option<&(dyn Error + 'static)>,
    ) {
        let Some((_, cursors)) = self.by_statement.remove(&statement_id) else {
            return;
        };
        for cursor_id in cursors {
            if let Some((_, result_set)) = self.result_sets.remove(&cursor_id) {
                self.forget_connection_cursor(result_set.connection_id, cursor_id);
                result_set.stop(error);
            }
        }
    }

    fn forget_connection_cursor(&self, connection_id: ConnectionId, cursor_id: CursorId) {
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.open_result_sets.remove(&cursor_id);
        }
    }

    fn forget_statement_cursor(&self, statement_id: StatementId, cursor_id: CursorId) {
        let now_empty = match self.by_statement.get_mut(&statement_id) {
            Some(mut cursors) => {
                cursors.remove(&cursor_id);
                cursors.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_statement
                .remove_if(&statement_id, |_, cursors| cursors.is_empty());
        }
    }

    /// Snapshot of an indexed connection.
    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.connections
            .get(&connection_id)
            .map(|record| record.snapshot())
    }

    /// Snapshot of an open cursor.
    pub fn result_set(&self, cursor_id: CursorId) -> Option<ResultSetSnapshot> {
        self.result_sets
            .get(&cursor_id)
            .map(|record| record.snapshot())
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn open_result_sets(&self) -> usize {
        self.result_sets.len()
    }
}

impl<F: ScopeFactory> Drop for ResourceTracker<F> {
    fn drop(&mut self) {
        let result_sets = std::mem::take(&mut self.result_sets);
        let connections = std::mem::take(&mut self.connections);
        if !result_sets.is_empty() || !connections.is_empty() {
            tracing::debug!(
                connections = connections.len(),
                result_sets = result_sets.len(),
                "Stopping scopes still open when the tracker was dropped"
            );
        }

        for (_, result_set) in result_sets {
            result_set.stop(None);
        }
        for (_, connection) in connections {
            connection.scope.stop(None);
        }
    }
}

impl<F: ScopeFactory> fmt::Debug for ResourceTracker<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("connections", &self.connections.len())
            .field("result_sets", &self.result_sets.len())
            .field("statements", &self.by_statement.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Stopped {
        context: ScopeContext,
        error: Option<String>,
        tags: Vec<(ScopeAttribute, String)>,
        events: Vec<&'static str>,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        opened: Arc<AtomicUsize>,
        stopped: Arc<Mutex<Vec<Stopped>>>,
    }

    impl Recorder {
        fn stopped(&self) -> Vec<Stopped> {
            self.stopped.lock().clone()
        }

        fn stops_for(&self, wanted: impl Fn(&ScopeContext) -> bool) -> usize {
            self.stopped
                .lock()
                .iter()
                .filter(|stopped| wanted(&stopped.context))
                .count()
        }
    }

    struct RecordingScope {
        context: ScopeContext,
        tags: Vec<(ScopeAttribute, String)>,
        events: Mutex<Vec<&'static str>>,
        stopped: Arc<Mutex<Vec<Stopped>>>,
    }

    impl ObservationScope for RecordingScope {
        fn tag(&mut self, attribute: ScopeAttribute, value: &str) {
            self.tags.push((attribute, value.to_string()));
        }

        fn event(&self, name: &'static str) {
            self.events.lock().push(name);
        }

        fn stop(self, error: Option<&(dyn Error + 'static)>) {
            self.stopped.lock().push(Stopped {
                context: self.context,
                error: error.map(|e| e.to_string()),
                tags: self.tags,
                events: self.events.into_inner(),
            });
        }
    }

    impl ScopeFactory for Recorder {
        type Scope = RecordingScope;

        fn open(&self, context: &ScopeContext) -> RecordingScope {
            self.opened.fetch_add(1, Ordering::SeqCst);
            RecordingScope {
                context: *context,
                tags: Vec::new(),
                events: Mutex::new(Vec::new()),
                stopped: Arc::clone(&self.stopped),
            }
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    const CONNECTION: ConnectionId = ConnectionId::new(1);
    const STATEMENT: StatementId = StatementId::new(10);
    const CURSOR_A: CursorId = CursorId::new(100);
    const CURSOR_B: CursorId = CursorId::new(101);

    fn tracker() -> (ResourceTracker<Recorder>, Recorder) {
        let recorder = Recorder::default();
        (ResourceTracker::with_scopes(recorder.clone()), recorder)
    }

    fn connect(tracker: &ResourceTracker<Recorder>, connection_id: ConnectionId) {
        let pending = tracker.on_acquire_begin(connection_id);
        tracker.on_acquire_end(
            pending,
            Ok(ConnectionDetails::new()
                .with_host("db.internal")
                .with_port(5432)
                .with_data_source_name("orders")),
        );
    }

    fn is_cursor(context: &ScopeContext, wanted: CursorId) -> bool {
        matches!(context, ScopeContext::ResultSet { cursor_id, .. } if *cursor_id == wanted)
    }

    fn is_connection(context: &ScopeContext) -> bool {
        matches!(context, ScopeContext::Connection { .. })
    }

    #[test]
    fn test_acquire_success_indexes_connection() {
        let (tracker, recorder) = tracker();
        connect(&tracker, CONNECTION);

        let snapshot = tracker.connection(CONNECTION).unwrap();
        assert_eq!(snapshot.details.host.as_deref(), Some("db.internal"));
        assert_eq!(snapshot.details.port, Some(5432));
        assert!(recorder.stopped().is_empty());

        tracker.on_connection_close(CONNECTION, None);
        let stopped = recorder.stopped();
        assert_eq!(stopped.len(), 1);
        assert_eq!(
            stopped[0].tags,
            vec![
                (ScopeAttribute::ServerAddress, "db.internal".to_string()),
                (ScopeAttribute::ServerPort, "5432".to_string()),
                (ScopeAttribute::DataSourceName, "orders".to_string()),
            ]
        );
        assert_eq!(tracker.open_connections(), 0);
    }

    #[test]
    fn test_acquire_failure_stops_scope_without_indexing() {
        let (tracker, recorder) = tracker();
        let pending = tracker.on_acquire_begin(CONNECTION);
        let error = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        tracker.on_acquire_end(pending, Err(&error));

        assert!(tracker.connection(CONNECTION).is_none());
        let stopped = recorder.stopped();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].error.as_deref(), Some("connection refused"));

        // The regular close path never runs for this attempt.
        tracker.on_connection_close(CONNECTION, None);
        tracker.on_commit(CONNECTION);
        assert_eq!(recorder.stopped().len(), 1);
    }

    #[test]
    fn test_dropped_acquisition_stops_once() {
        let (tracker, recorder) = tracker();
        let pending = tracker.on_acquire_begin(CONNECTION);
        assert_eq!(pending.in_scope(|| 7), 7);
        drop(pending);

        assert_eq!(recorder.stopped().len(), 1);
        assert!(tracker.connection(CONNECTION).is_none());
    }

    #[test]
    fn test_commit_and_rollback_are_stamped_independently() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let recorder = Recorder::default();
        let tracker = ResourceTracker::with_scopes(recorder.clone()).with_clock(FixedClock(at));
        connect(&tracker, CONNECTION);

        tracker.on_commit(CONNECTION);
        let snapshot = tracker.connection(CONNECTION).unwrap();
        assert_eq!(snapshot.committed_at, Some(at));
        assert_eq!(snapshot.rolled_back_at, None);

        tracker.on_rollback(CONNECTION);
        let snapshot = tracker.connection(CONNECTION).unwrap();
        assert_eq!(snapshot.committed_at, Some(at));
        assert_eq!(snapshot.rolled_back_at, Some(at));

        tracker.on_connection_close(CONNECTION, None);
        assert_eq!(recorder.stopped()[0].events, vec!["commit", "rollback"]);
    }

    #[test]
    fn test_events_for_unknown_connection_are_ignored() {
        let (tracker, recorder) = tracker();
        tracker.on_commit(ConnectionId::new(99));
        tracker.on_rollback(ConnectionId::new(99));
        tracker.on_connection_close(ConnectionId::new(99), None);
        tracker.on_statement_close(StatementId::new(99), None);
        tracker.on_cursor_close(CursorId::new(99), None);
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 0);
        assert!(recorder.stopped().is_empty());
    }

    #[test]
    fn test_cursor_created_once_and_counts_rows() {
        let (tracker, recorder) = tracker();
        connect(&tracker, CONNECTION);

        tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, false);
        assert!(tracker.result_set(CURSOR_A).is_none());

        for _ in 0..3 {
            tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, true);
        }
        tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, false);

        let snapshot = tracker.result_set(CURSOR_A).unwrap();
        assert_eq!(snapshot.row_count, 3);
        assert!(!snapshot.is_generated_keys_cursor);
        assert_eq!(tracker.connection(CONNECTION).unwrap().open_result_sets, vec![CURSOR_A]);
        // One connection scope, one cursor scope.
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 2);

        tracker.on_cursor_close(CURSOR_A, None);
        let stopped = recorder.stopped();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].tags, vec![(ScopeAttribute::RowCount, "3".to_string())]);
        assert!(tracker.connection(CONNECTION).unwrap().open_result_sets.is_empty());
    }

    #[test]
    fn test_cursor_close_twice_stops_once() {
        let (tracker, recorder) = tracker();
        tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, true);

        tracker.on_cursor_close(CURSOR_A, None);
        tracker.on_cursor_close(CURSOR_A, None);

        assert_eq!(recorder.stops_for(|context| is_cursor(context, CURSOR_A)), 1);
    }

    #[test]
    fn test_generated_keys_cursor_is_flagged() {
        let (tracker, recorder) = tracker();
        tracker.on_generated_keys_advance(CONNECTION, STATEMENT, CURSOR_A, true);
        assert!(tracker.result_set(CURSOR_A).unwrap().is_generated_keys_cursor);

        tracker.on_statement_close(STATEMENT, None);
        assert!(matches!(
            recorder.stopped()[0].context,
            ScopeContext::ResultSet {
                generated_keys: true,
                ..
            }
        ));
    }

    fn open_two_cursors(tracker: &ResourceTracker<Recorder>) {
        connect(tracker, CONNECTION);
        tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, true);
        tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_B, true);
    }

    fn assert_each_stopped_once(recorder: &Recorder) {
        assert_eq!(recorder.stopped().len(), 3);
        assert_eq!(recorder.stops_for(is_connection), 1);
        assert_eq!(recorder.stops_for(|context| is_cursor(context, CURSOR_A)), 1);
        assert_eq!(recorder.stops_for(|context| is_cursor(context, CURSOR_B)), 1);
    }

    #[test]
    fn test_connection_close_cascades_to_cursors() {
        let (tracker, recorder) = tracker();
        open_two_cursors(&tracker);

        tracker.on_connection_close(CONNECTION, None);

        assert_each_stopped_once(&recorder);
        assert_eq!(tracker.open_result_sets(), 0);
        // Later cascades find nothing left to stop.
        tracker.on_statement_close(STATEMENT, None);
        tracker.on_connection_close(CONNECTION, None);
        assert_each_stopped_once(&recorder);
    }

    #[test]
    fn test_statement_close_then_connection_close() {
        let (tracker, recorder) = tracker();
        open_two_cursors(&tracker);

        tracker.on_statement_close(STATEMENT, None);
        assert_eq!(recorder.stopped().len(), 2);
        assert!(tracker.connection(CONNECTION).unwrap().open_result_sets.is_empty());

        tracker.on_connection_close(CONNECTION, None);
        assert_each_stopped_once(&recorder);
    }

    #[test]
    fn test_cursor_close_then_statement_and_connection_close() {
        let (tracker, recorder) = tracker();
        open_two_cursors(&tracker);

        tracker.on_cursor_close(CURSOR_A, None);
        tracker.on_connection_close(CONNECTION, None);
        tracker.on_statement_close(STATEMENT, None);
        tracker.on_cursor_close(CURSOR_B, None);

        assert_each_stopped_once(&recorder);
    }

    #[test]
    fn test_close_error_is_attached_to_cascaded_cursors() {
        let (tracker, recorder) = tracker();
        open_two_cursors(&tracker);

        let error = io::Error::new(io::ErrorKind::BrokenPipe, "socket closed");
        tracker.on_connection_close(CONNECTION, Some(&error));

        for stopped in recorder.stopped() {
            assert_eq!(stopped.error.as_deref(), Some("socket closed"));
        }
    }

    #[test]
    fn test_reused_identity_releases_previous_record() {
        let (tracker, recorder) = tracker();
        connect(&tracker, CONNECTION);
        tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, true);
        connect(&tracker, CONNECTION);

        assert_eq!(recorder.stopped().len(), 2);
        assert_eq!(tracker.open_connections(), 1);
        assert_eq!(tracker.open_result_sets(), 0);
    }

    #[test]
    fn test_drop_stops_remaining_scopes() {
        let (tracker, recorder) = tracker();
        open_two_cursors(&tracker);
        drop(tracker);
        assert_each_stopped_once(&recorder);
    }

    #[test]
    fn test_racing_closes_stop_each_scope_once() {
        for _ in 0..20 {
            let (tracker, recorder) = tracker();
            let tracker = Arc::new(tracker);
            open_two_cursors(&tracker);

            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|worker| {
                    let tracker = Arc::clone(&tracker);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        match worker {
                            0 => tracker.on_connection_close(CONNECTION, None),
                            1 => tracker.on_statement_close(STATEMENT, None),
                            2 => tracker.on_cursor_close(CURSOR_A, None),
                            _ => tracker.on_cursor_close(CURSOR_B, None),
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_each_stopped_once(&recorder);
            assert_eq!(tracker.open_result_sets(), 0);
            assert_eq!(tracker.open_connections(), 0);
        }
    }

    #[test]
    fn test_first_advance_racing_closes() {
        for _ in 0..50 {
            let (tracker, recorder) = tracker();
            let tracker = Arc::new(tracker);
            connect(&tracker, CONNECTION);

            let barrier = Arc::new(Barrier::new(3));
            let handles: Vec<_> = (0..3)
                .map(|worker| {
                    let tracker = Arc::clone(&tracker);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        match worker {
                            0 => tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, true),
                            1 => tracker.on_connection_close(CONNECTION, None),
                            _ => tracker.on_statement_close(STATEMENT, None),
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            // Whatever the advance left behind goes away with the remaining closes.
            tracker.on_cursor_close(CURSOR_A, None);
            tracker.on_statement_close(STATEMENT, None);

            assert_eq!(recorder.opened.load(Ordering::SeqCst), 2);
            assert_eq!(recorder.stopped().len(), 2);
            assert_eq!(recorder.stops_for(is_connection), 1);
            assert_eq!(recorder.stops_for(|context| is_cursor(context, CURSOR_A)), 1);
            assert_eq!(tracker.open_result_sets(), 0);
            assert_eq!(tracker.open_connections(), 0);
        }
    }

    #[test]
    fn test_independent_connections_in_parallel() {
        let (tracker, recorder) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for round in 0..50u64 {
                        let id = worker * 1_000 + round;
                        connect(&tracker, ConnectionId::new(id));
                        tracker.on_cursor_advance(
                            ConnectionId::new(id),
                            StatementId::new(id),
                            CursorId::new(id),
                            true,
                        );
                        tracker.on_commit(ConnectionId::new(id));
                        tracker.on_connection_close(ConnectionId::new(id), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(recorder.opened.load(Ordering::SeqCst), 8 * 50 * 2);
        assert_eq!(recorder.stopped().len(), 8 * 50 * 2);
        assert_eq!(tracker.open_connections(), 0);
        assert_eq!(tracker.open_result_sets(), 0);
    }

    mod tracing_spans {
        use tracing::span;
        use tracing_subscriber::layer::{Context, SubscriberExt};
        use tracing_subscriber::registry::LookupSpan;
        use tracing_subscriber::Layer;

        use super::*;

        struct CloseCounter(Arc<AtomicUsize>);

        impl<S> Layer<S> for CloseCounter
        where
            S: tracing::Subscriber + for<'a> LookupSpan<'a>,
        {
            fn on_close(&self, _id: span::Id, _ctx: Context<'_, S>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        #[test]
        fn test_tracing_spans_close_once() {
            let closes = Arc::new(AtomicUsize::new(0));
            let subscriber =
                tracing_subscriber::registry().with(CloseCounter(Arc::clone(&closes)));

            tracing::subscriber::with_default(subscriber, || {
                let tracker = ResourceTracker::new();
                let pending = tracker.on_acquire_begin(CONNECTION);
                tracker.on_acquire_end(pending, Ok(ConnectionDetails::new().with_port(5432)));
                tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_A, true);
                tracker.on_cursor_advance(CONNECTION, STATEMENT, CURSOR_B, true);
                tracker.on_commit(CONNECTION);

                tracker.on_statement_close(STATEMENT, None);
                assert_eq!(closes.load(Ordering::SeqCst), 2);

                tracker.on_connection_close(CONNECTION, None);
                tracker.on_connection_close(CONNECTION, None);
                assert_eq!(closes.load(Ordering::SeqCst), 3);
            });
        }
    }
}
