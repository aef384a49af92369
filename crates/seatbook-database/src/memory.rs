//! In-memory booking store for single-node runs and tests.
//!
//! Models the parts of PostgreSQL the booking engine depends on:
//!
//! - row locks: `FOR SHARE` conflicts with exclusive holders, `FOR UPDATE`
//!   with any other holder, and `SKIP LOCKED` passes over conflicting rows
//!   instead of waiting;
//! - snapshots: under `REPEATABLE READ` and `SERIALIZABLE` a transaction
//!   reads the state as of its first statement, and locking or updating a
//!   row changed after that snapshot fails with a serialization error;
//! - writes take an exclusive row lock and wait for other holders. When a
//!   transaction waits to upgrade its shared lock and another sharer of the
//!   same row tries to upgrade too, the second one fails with a deadlock
//!   error, standing in for the store's deadlock detector;
//! - the uniqueness contract of `assign_seat`;
//! - `lock_timeout`: a statement waiting longer than the transaction's lock
//!   timeout for a row lock fails with a timeout error.
//!
//! Locks are released and waiters woken on commit, rollback and when a
//! connection is dropped with a transaction still open.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, trace};

use seatbook_core::error::{AppError, ErrorKind};
use seatbook_core::result::AppResult;
use seatbook_core::types::{
    IsolationLevel, PassengerId, RowLock, RowLockMode, SeatId, TripId,
};
use seatbook_entity::{Passenger, Seat, Trip};

use crate::store::{StoreConnection, StoreConnector};

/// Store operation at which a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// `begin`
    Begin,
    /// `set_isolation`
    SetIsolation,
    /// `select_seat`
    Select,
    /// `assign_seat`
    Assign,
    /// `commit`
    Commit,
    /// `rollback`. The transaction stays open when it fails.
    Rollback,
}

/// Counters describing how the store has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Connections opened so far.
    pub connects: usize,
    /// Connections currently open.
    pub open_connections: usize,
    /// Transactions currently open.
    pub open_transactions: usize,
    /// Highest number of transactions ever open at the same time.
    pub max_open_transactions: usize,
    /// Transactions committed.
    pub commits: usize,
    /// Transactions rolled back, explicitly or by abandonment.
    pub rollbacks: usize,
}

/// In-memory booking store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    lock_released: Notify,
    latency: Duration,
}

#[derive(Debug, Default)]
struct State {
    passengers: Vec<Passenger>,
    trips: BTreeMap<TripId, TripRow>,
    seats: BTreeMap<SeatId, SeatRow>,
    locks: HashMap<SeatId, RowLocks>,
    commit_seq: u64,
    next_txn: u64,
    connect_budget: Option<usize>,
    faults: Vec<Fault>,
    stats: StoreStats,
}

#[derive(Debug)]
struct TripRow {
    trip: Trip,
    claimed: bool,
}

#[derive(Debug)]
struct SeatRow {
    seat: Seat,
    passenger: Option<PassengerId>,
    /// Commit sequence number of the last change.
    changed_at: u64,
}

impl SeatRow {
    fn free_in(&self, snapshot: Option<u64>) -> bool {
        match snapshot {
            None => self.passenger.is_none(),
            Some(seq) => self.passenger.is_none() || self.changed_at > seq,
        }
    }
}

#[derive(Debug, Default)]
struct RowLocks {
    shared: HashSet<u64>,
    exclusive: Option<u64>,
    /// Sharers waiting to upgrade to an exclusive lock.
    upgrading: HashSet<u64>,
}

impl RowLocks {
    fn conflicts_with(&self, txn: u64, mode: RowLockMode) -> bool {
        let other_exclusive = self.exclusive.is_some_and(|holder| holder != txn);
        match mode {
            RowLockMode::None => false,
            RowLockMode::Share => other_exclusive,
            RowLockMode::Update => other_exclusive || self.other_sharers(txn),
        }
    }

    fn other_sharers(&self, txn: u64) -> bool {
        self.shared.iter().any(|holder| *holder != txn)
    }

    fn grant(&mut self, txn: u64, mode: RowLockMode) {
        self.upgrading.remove(&txn);
        match mode {
            RowLockMode::None => {}
            RowLockMode::Share => {
                self.shared.insert(txn);
            }
            RowLockMode::Update => self.exclusive = Some(txn),
        }
    }

    fn release(&mut self, txn: u64) {
        self.shared.remove(&txn);
        self.upgrading.remove(&txn);
        if self.exclusive == Some(txn) {
            self.exclusive = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none() && self.upgrading.is_empty()
    }
}

#[derive(Debug)]
struct Fault {
    point: FaultPoint,
    kind: ErrorKind,
    remaining: usize,
}

#[derive(Debug)]
struct Txn {
    id: u64,
    isolation: IsolationLevel,
    snapshot: Option<u64>,
    statements: usize,
    lock_timeout: Option<Duration>,
    pending: Vec<(SeatId, PassengerId)>,
}

impl Txn {
    /// Snapshot for the next statement, taken on the first one under
    /// snapshot isolation.
    fn statement_snapshot(&mut self, commit_seq: u64) -> Option<u64> {
        self.statements += 1;
        if self.isolation.uses_transaction_snapshot() {
            Some(*self.snapshot.get_or_insert(commit_seq))
        } else {
            None
        }
    }

    /// Latest instant a statement starting now may wait for a row lock.
    fn lock_wait_limit(&self) -> Option<Instant> {
        self.lock_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout))
    }
}

fn lock_timeout_error() -> AppError {
    AppError::timeout("canceling statement due to lock timeout")
}

/// Wait for a lock release, up to `limit`.
async fn wait_for_release(
    released: Pin<&mut Notified<'_>>,
    limit: Option<Instant>,
) -> AppResult<()> {
    match limit {
        Some(at) => tokio::time::timeout_at(at, released)
            .await
            .map_err(|_| lock_timeout_error()),
        None => {
            released.await;
            Ok(())
        }
    }
}

enum Step<T> {
    Done(T),
    Blocked(SeatId),
}

impl State {
    fn take_fault(&mut self, point: FaultPoint) -> AppResult<()> {
        if let Some(fault) = self
            .faults
            .iter_mut()
            .find(|f| f.point == point && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err(AppError::new(
                fault.kind,
                format!("injected {point:?} failure"),
            ));
        }
        Ok(())
    }

    fn try_select(
        &mut self,
        txn: u64,
        snapshot: Option<u64>,
        trip: TripId,
        lock: RowLock,
    ) -> AppResult<Step<Seat>> {
        for row in self.seats.values().filter(|r| r.seat.trip_id == trip) {
            if !row.free_in(snapshot) {
                continue;
            }
            if lock.mode == RowLockMode::None {
                return Ok(Step::Done(row.seat.clone()));
            }

            let conflicting = self
                .locks
                .get(&row.seat.id)
                .is_some_and(|locks| locks.conflicts_with(txn, lock.mode));
            if conflicting {
                if lock.skip_locked {
                    continue;
                }
                return Ok(Step::Blocked(row.seat.id));
            }
            if snapshot.is_some_and(|seq| row.changed_at > seq) {
                return Err(AppError::deadlock(
                    "could not serialize access due to concurrent update",
                ));
            }

            self.locks
                .entry(row.seat.id)
                .or_default()
                .grant(txn, lock.mode);
            return Ok(Step::Done(row.seat.clone()));
        }

        Err(AppError::not_found(format!(
            "No free seat visible on trip {trip}"
        )))
    }

    fn try_assign(
        &mut self,
        txn: &mut Txn,
        snapshot: Option<u64>,
        passenger: PassengerId,
        seat: SeatId,
    ) -> AppResult<Step<()>> {
        let row = self
            .seats
            .get(&seat)
            .ok_or_else(|| AppError::not_found(format!("Seat {seat} does not exist")))?;

        if let Some(locks) = self.locks.get_mut(&seat) {
            if locks.other_sharers(txn.id) {
                if locks.shared.contains(&txn.id) {
                    if locks.upgrading.iter().any(|waiter| *waiter != txn.id) {
                        return Err(AppError::deadlock(format!(
                            "deadlock detected upgrading lock on seat {seat}"
                        )));
                    }
                    locks.upgrading.insert(txn.id);
                }
                return Ok(Step::Blocked(seat));
            }
            if locks.exclusive.is_some_and(|holder| holder != txn.id) {
                return Ok(Step::Blocked(seat));
            }
        }

        if snapshot.is_some_and(|seq| row.changed_at > seq) {
            return Err(AppError::deadlock(
                "could not serialize access due to concurrent update",
            ));
        }
        if row.passenger.is_some() {
            return Err(AppError::conflict(format!(
                "Seat {seat} was assigned by a concurrent transaction"
            )));
        }

        let trip = row.seat.trip_id;
        let already_seated = self
            .seats
            .values()
            .any(|r| r.seat.trip_id == trip && r.passenger == Some(passenger))
            || txn.pending.iter().any(|(_, p)| *p == passenger);
        if already_seated {
            return Err(AppError::conflict(format!(
                "Passenger {passenger} already holds a seat on trip {trip}"
            )));
        }

        self.locks
            .entry(seat)
            .or_default()
            .grant(txn.id, RowLockMode::Update);
        txn.pending.push((seat, passenger));
        Ok(Step::Done(()))
    }

    fn end_transaction(&mut self, txn: &Txn, committed: bool) {
        if committed && !txn.pending.is_empty() {
            self.commit_seq += 1;
            for (seat, passenger) in &txn.pending {
                if let Some(row) = self.seats.get_mut(seat) {
                    row.passenger = Some(*passenger);
                    row.changed_at = self.commit_seq;
                }
            }
        }

        self.locks.retain(|_, locks| {
            locks.release(txn.id);
            !locks.is_empty()
        });

        self.stats.open_transactions = self.stats.open_transactions.saturating_sub(1);
        if committed {
            self.stats.commits += 1;
        } else {
            self.stats.rollbacks += 1;
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store whose operations each take `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                latency,
                ..Shared::default()
            }),
        }
    }

    /// Add a passenger with the next free id.
    pub fn add_passenger(&self, name: impl Into<String>) -> Passenger {
        let mut state = self.shared.state();
        let id = PassengerId(state.passengers.len() as i32 + 1);
        let passenger = Passenger::new(id, name);
        state.passengers.push(passenger.clone());
        passenger
    }

    /// Add a trip with a full `rows` x `seats_per_row` cabin of free seats.
    pub fn add_trip(&self, code: impl Into<String>, rows: u32, seats_per_row: u32) -> Trip {
        let mut state = self.shared.state();
        let trip = Trip::new(TripId(state.trips.len() as i32 + 1), code);

        for row_no in 1..=rows as i32 {
            for column_no in 1..=seats_per_row as i32 {
                let id = SeatId(state.seats.len() as i32 + 1);
                let seat = Seat::new(id, trip.id, row_no, column_no);
                state.seats.insert(
                    id,
                    SeatRow {
                        seat,
                        passenger: None,
                        changed_at: 0,
                    },
                );
            }
        }

        state.trips.insert(
            trip.id,
            TripRow {
                trip: trip.clone(),
                claimed: false,
            },
        );
        trip
    }

    /// Allow `n` more successful connects; later ones fail with `Connection`.
    pub fn fail_connections_after(&self, n: usize) {
        self.shared.state().connect_budget = Some(n);
    }

    /// Make the next `times` calls at `point` fail with an error of `kind`.
    pub fn inject_fault(&self, point: FaultPoint, kind: ErrorKind, times: usize) {
        self.shared.state().faults.push(Fault {
            point,
            kind,
            remaining: times,
        });
    }

    /// Committed seat assignments of a trip, in seat order.
    pub fn assignments(&self, trip: TripId) -> Vec<(Seat, PassengerId)> {
        self.shared
            .state()
            .seats
            .values()
            .filter(|r| r.seat.trip_id == trip)
            .filter_map(|r| r.passenger.map(|p| (r.seat.clone(), p)))
            .collect()
    }

    /// Number of unassigned seats on a trip.
    pub fn free_seat_count(&self, trip: TripId) -> usize {
        self.shared
            .state()
            .seats
            .values()
            .filter(|r| r.seat.trip_id == trip && r.passenger.is_none())
            .count()
    }

    /// Whether a trip has been claimed by a run.
    pub fn is_claimed(&self, trip: TripId) -> bool {
        self.shared
            .state()
            .trips
            .get(&trip)
            .is_some_and(|row| row.claimed)
    }

    /// Usage counters.
    pub fn stats(&self) -> StoreStats {
        self.shared.state().stats
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> AppResult<MemoryConnection> {
        self.shared.round_trip().await;

        let mut state = self.shared.state();
        if let Some(budget) = state.connect_budget.as_mut() {
            if *budget == 0 {
                return Err(AppError::connection("memory store refused the connection"));
            }
            *budget -= 1;
        }
        state.stats.connects += 1;
        state.stats.open_connections += 1;

        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
            txn: None,
        })
    }
}

/// Connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    txn: Option<Txn>,
}

impl MemoryConnection {
    fn open_txn(&mut self) -> AppResult<&mut Txn> {
        self.txn
            .as_mut()
            .ok_or_else(|| AppError::contract_violation("no transaction in progress"))
    }

    fn finish(&mut self, committed: bool) -> bool {
        let Some(txn) = self.txn.take() else {
            return false;
        };
        self.shared.state().end_transaction(&txn, committed);
        self.shared.lock_released.notify_waiters();
        true
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn list_passengers(&mut self) -> AppResult<Vec<Passenger>> {
        self.shared.round_trip().await;
        let mut passengers = self.shared.state().passengers.clone();
        passengers.sort_by_key(|p| p.id);
        Ok(passengers)
    }

    async fn next_unclaimed_trip(&mut self) -> AppResult<Trip> {
        self.shared.round_trip().await;
        self.shared
            .state()
            .trips
            .values()
            .find(|row| !row.claimed)
            .map(|row| row.trip.clone())
            .ok_or_else(|| AppError::not_found("No unclaimed trip left"))
    }

    async fn claim_trip(&mut self, trip: TripId) -> AppResult<()> {
        self.shared.round_trip().await;
        let mut state = self.shared.state();
        match state.trips.get_mut(&trip) {
            Some(row) if !row.claimed => {
                row.claimed = true;
                Ok(())
            }
            _ => Err(AppError::conflict(format!(
                "Trip {trip} is already claimed or does not exist"
            ))),
        }
    }

    async fn begin(&mut self) -> AppResult<()> {
        self.shared.round_trip().await;
        if self.txn.is_some() {
            return Err(AppError::contract_violation(
                "there is already a transaction in progress",
            ));
        }

        let mut state = self.shared.state();
        state.take_fault(FaultPoint::Begin)?;
        state.next_txn += 1;
        state.stats.open_transactions += 1;
        state.stats.max_open_transactions = state
            .stats
            .max_open_transactions
            .max(state.stats.open_transactions);

        self.txn = Some(Txn {
            id: state.next_txn,
            isolation: IsolationLevel::ReadCommitted,
            snapshot: None,
            statements: 0,
            lock_timeout: None,
            pending: Vec::new(),
        });
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> AppResult<()> {
        self.shared.round_trip().await;
        self.shared.state().take_fault(FaultPoint::SetIsolation)?;
        let txn = self.open_txn()?;
        if txn.statements > 0 {
            return Err(AppError::database(
                "SET TRANSACTION ISOLATION LEVEL must be called before any query",
            ));
        }
        txn.isolation = level;
        Ok(())
    }

    async fn set_lock_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        self.shared.round_trip().await;
        self.open_txn()?.lock_timeout = Some(timeout);
        Ok(())
    }

    async fn select_seat(&mut self, trip: TripId, lock: RowLock) -> AppResult<Seat> {
        self.shared.round_trip().await;
        self.shared.state().take_fault(FaultPoint::Select)?;

        let shared = Arc::clone(&self.shared);
        let txn = self.open_txn()?;
        let wait_limit = txn.lock_wait_limit();
        let mut snapshot = None;
        let mut first = true;

        loop {
            let released = shared.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = shared.state();
                if first {
                    snapshot = txn.statement_snapshot(state.commit_seq);
                    first = false;
                }
                match state.try_select(txn.id, snapshot, trip, lock)? {
                    Step::Done(seat) => {
                        trace!(seat_id = %seat.id, txn = txn.id, "Seat selected");
                        return Ok(seat);
                    }
                    Step::Blocked(seat) => {
                        debug!(seat_id = %seat, txn = txn.id, "Selection waiting for row lock");
                    }
                }
            }

            wait_for_release(released, wait_limit).await?;
        }
    }

    async fn assign_seat(&mut self, passenger: PassengerId, seat: SeatId) -> AppResult<()> {
        self.shared.round_trip().await;
        self.shared.state().take_fault(FaultPoint::Assign)?;

        let shared = Arc::clone(&self.shared);
        let txn = self.open_txn()?;
        let wait_limit = txn.lock_wait_limit();
        let mut snapshot = None;
        let mut first = true;

        loop {
            let released = shared.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = shared.state();
                if first {
                    snapshot = txn.statement_snapshot(state.commit_seq);
                    first = false;
                }
                match state.try_assign(txn, snapshot, passenger, seat)? {
                    Step::Done(()) => return Ok(()),
                    Step::Blocked(seat) => {
                        debug!(seat_id = %seat, txn = txn.id, "Assignment waiting for row lock");
                    }
                }
            }

            wait_for_release(released, wait_limit).await?;
        }
    }

    async fn commit(&mut self) -> AppResult<()> {
        self.shared.round_trip().await;
        if self.txn.is_none() {
            return Err(AppError::contract_violation("no transaction in progress"));
        }

        let fault = self.shared.state().take_fault(FaultPoint::Commit);
        if let Err(err) = fault {
            self.finish(false);
            return Err(err);
        }
        self.finish(true);
        Ok(())
    }

    async fn rollback(&mut self) -> AppResult<()> {
        self.shared.round_trip().await;
        self.shared.state().take_fault(FaultPoint::Rollback)?;
        self.finish(false);
        Ok(())
    }

    fn abandon_transaction(&mut self) {
        if self.finish(false) {
            debug!("Abandoned memory transaction rolled back");
        }
    }

    async fn close(self) -> AppResult<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.finish(false);
        let mut state = self.shared.state();
        state.stats.open_connections = state.stats.open_connections.saturating_sub(1);
    }
}
