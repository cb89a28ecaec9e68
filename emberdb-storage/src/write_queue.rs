// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Writer queue and batch-group state machine
//!
//! Writers are stack-owned by their submitting threads and chained into a
//! lock-free intrusive list: arrival appends to the newest end with a CAS,
//! and whoever lands on an empty list is the leader. The leader walks the
//! consecutive prefix of compatible followers, commits on their behalf, and
//! on exit promotes the next queued writer.
//!
//! ## State machine
//!
//! ```text
//! INIT ─(first in queue)──────────────────► GROUP_LEADER
//! INIT ─(queue non-empty)─────────────────► LOCKED_WAITING
//! GROUP_LEADER ─(pipelined, WAL done)─────► MEMTABLE_WRITER_LEADER
//! LEADER/LOCKED_WAITING ─(parallel launch)► PARALLEL_MEMTABLE_WRITER
//! any ─(group exited / committed)─────────► COMPLETED
//! ```
//!
//! Every writer carries its own parking primitive (mutex + condvar). A
//! suspended writer spins briefly, then claims `LOCKED_WAITING` with a CAS;
//! the claim is the permission to sleep, and whoever changes the state next
//! must take the writer's mutex and signal it.
//!
//! ## Safety
//!
//! The list borrows stack-allocated `Writer`s across threads through raw
//! pointers. The protocol keeps that sound: a writer's owning thread never
//! returns from the queue until it observes a terminal state, and the last
//! foreign touch of any writer is the mutex-protected state store that
//! publishes that terminal state. Links are only rewritten by the unique
//! current leader (or the stall path, which runs under the global mutex).

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use emberdb_core::{EmberError, Result, SequenceNumber, MAX_SEQUENCE_NUMBER};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::db::{PreReleaseCallback, WriteCallback};
use crate::options::WriteOptions;
use crate::write_batch::WriteBatch;

pub(crate) const STATE_INIT: u8 = 1;
pub(crate) const STATE_GROUP_LEADER: u8 = 2;
pub(crate) const STATE_MEMTABLE_WRITER_LEADER: u8 = 4;
pub(crate) const STATE_PARALLEL_MEMTABLE_WRITER: u8 = 8;
pub(crate) const STATE_COMPLETED: u8 = 16;
pub(crate) const STATE_LOCKED_WAITING: u8 = 32;

/// Iterations of the optimistic spin before a waiter claims its parking
/// slot and blocks.
const AWAIT_SPIN_ITERATIONS: usize = 200;

/// One client's attempt to commit a batch. Owned by the submitting thread
/// for its whole lifetime; the queue and the current leader borrow it.
pub(crate) struct Writer {
    pub batch: Option<WriteBatch>,
    pub sync: bool,
    pub no_slowdown: bool,
    pub disable_wal: bool,
    pub disable_memtable: bool,
    /// Sub-batches in `batch`; only meaningful under seq-per-batch.
    pub batch_cnt: usize,
    pub callback: Option<Box<dyn WriteCallback>>,
    pub pre_release_callback: Option<Box<dyn PreReleaseCallback>>,

    /// Base sequence assigned by the leader.
    pub sequence: SequenceNumber,
    /// WAL the batch landed in.
    pub log_used: u64,
    /// Outcome of the write itself.
    pub status: Result<()>,
    /// Outcome of the pre-commit callback.
    pub callback_status: Result<()>,
    callback_checked: bool,

    state: AtomicU8,
    pub write_group: *mut WriteGroup,
    link_older: *mut Writer,
    link_newer: *mut Writer,

    state_mutex: Mutex<()>,
    state_cv: Condvar,
}

// Writers are shared across threads through the queue protocol described in
// the module docs; the raw links are what inhibit the auto impls.
unsafe impl Send for Writer {}
unsafe impl Sync for Writer {}

impl Writer {
    pub fn new(
        batch: WriteBatch,
        options: &WriteOptions,
        disable_memtable: bool,
        batch_cnt: usize,
        callback: Option<Box<dyn WriteCallback>>,
        pre_release_callback: Option<Box<dyn PreReleaseCallback>>,
    ) -> Self {
        Self {
            batch: Some(batch),
            sync: options.sync,
            no_slowdown: options.no_slowdown,
            disable_wal: options.disable_wal,
            disable_memtable,
            batch_cnt,
            callback,
            pre_release_callback,
            sequence: MAX_SEQUENCE_NUMBER,
            log_used: 0,
            status: Ok(()),
            callback_status: Ok(()),
            callback_checked: false,
            state: AtomicU8::new(STATE_INIT),
            write_group: ptr::null_mut(),
            link_older: ptr::null_mut(),
            link_newer: ptr::null_mut(),
            state_mutex: Mutex::new(()),
            state_cv: Condvar::new(),
        }
    }

    /// Batchless writer used for exclusive passage and internal sentinels.
    pub fn empty() -> Self {
        Self::new(WriteBatch::new(), &WriteOptions::default(), false, 0, None, None)
            .with_no_batch()
    }

    fn with_no_batch(mut self) -> Self {
        self.batch = None;
        self
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Run the pre-commit callback once. Returns whether this writer is
    /// still eligible to commit.
    pub fn check_callback(&mut self, db: &crate::db::Db) -> bool {
        if !self.callback_checked {
            if let Some(callback) = &self.callback {
                self.callback_status = callback.callback(db);
            }
            self.callback_checked = true;
        }
        self.status.is_ok() && self.callback_status.is_ok()
    }

    pub fn callback_failed(&self) -> bool {
        self.callback.is_some() && self.callback_status.is_err()
    }

    pub fn should_write_to_memtable(&self) -> bool {
        self.status.is_ok() && !self.callback_failed() && !self.disable_memtable
    }

    pub fn batch_count(&self) -> u32 {
        self.batch.as_ref().map(|b| b.count()).unwrap_or(0)
    }

    pub fn batch_byte_size(&self) -> u64 {
        self.batch.as_ref().map(|b| b.byte_size() as u64).unwrap_or(0)
    }

    /// Callback failures take precedence over the (successful) group status.
    pub fn final_status(&self) -> Result<()> {
        if self.status.is_err() {
            self.status.clone()
        } else {
            self.callback_status.clone()
        }
    }
}

/// A leader plus the consecutive followers committing with it.
pub(crate) struct WriteGroup {
    pub leader: *mut Writer,
    pub last_writer: *mut Writer,
    pub size: usize,
    /// Writers (leader included) still running the parallel memtable phase.
    pub running: AtomicUsize,
    /// Highest sequence assigned to the group; the exit winner publishes it.
    pub last_sequence: SequenceNumber,
    /// First error raised by any parallel applier.
    pub status: Mutex<Result<()>>,
}

impl Default for WriteGroup {
    fn default() -> Self {
        Self {
            leader: ptr::null_mut(),
            last_writer: ptr::null_mut(),
            size: 0,
            running: AtomicUsize::new(0),
            last_sequence: 0,
            status: Mutex::new(Ok(())),
        }
    }
}

impl WriteGroup {
    /// Iterate members oldest (leader) to newest. Safe only while the group
    /// is intact: between enter and exit on the owning leader's thread.
    pub unsafe fn iter(&self) -> WriteGroupIter {
        WriteGroupIter {
            current: self.leader,
            last: self.last_writer,
            done: self.leader.is_null(),
        }
    }
}

pub(crate) struct WriteGroupIter {
    current: *mut Writer,
    last: *mut Writer,
    done: bool,
}

impl Iterator for WriteGroupIter {
    type Item = *mut Writer;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.current;
        if current == self.last {
            self.done = true;
        } else {
            self.current = unsafe { (*current).link_newer };
        }
        Some(current)
    }
}

enum LinkOutcome {
    Leader,
    Follower,
    /// Failed at the stall barrier before ever linking.
    Rejected,
}

/// The writer queue: a lock-free intrusive list plus the machinery to elect
/// leaders, form groups, and park everyone else.
pub(crate) struct WriteQueue {
    newest_writer: AtomicPtr<Writer>,
    newest_memtable_writer: AtomicPtr<Writer>,
    /// Newest sequence handed out by a WAL-phase leader; pipelined groups
    /// read this instead of the published counter, which lags while earlier
    /// groups are still applying.
    last_sequence: AtomicU64,
    /// Writers linked and not yet fully exited; feeds the group byte budget.
    queued_writers: AtomicUsize,
    /// Byte size of the group most recently formed.
    last_group_bytes: AtomicU64,

    stall_mu: Mutex<()>,
    stall_cv: Condvar,
    /// Barrier node linked at the newest end while a stall is active.
    /// Identified by address, never dereferenced for data.
    stall_sentinel: Box<Writer>,

    enable_pipelined_write: bool,
    allow_concurrent_memtable_write: bool,
    max_write_batch_group_size_bytes: u64,
}

unsafe impl Send for WriteQueue {}
unsafe impl Sync for WriteQueue {}

impl WriteQueue {
    pub fn new(
        enable_pipelined_write: bool,
        allow_concurrent_memtable_write: bool,
        max_write_batch_group_size_bytes: u64,
    ) -> Self {
        Self {
            newest_writer: AtomicPtr::new(ptr::null_mut()),
            newest_memtable_writer: AtomicPtr::new(ptr::null_mut()),
            last_sequence: AtomicU64::new(0),
            queued_writers: AtomicUsize::new(0),
            last_group_bytes: AtomicU64::new(0),
            stall_mu: Mutex::new(()),
            stall_cv: Condvar::new(),
            stall_sentinel: Box::new(Writer::empty()),
            enable_pipelined_write,
            allow_concurrent_memtable_write,
            max_write_batch_group_size_bytes,
        }
    }

    fn stall_sentinel_ptr(&self) -> *mut Writer {
        &*self.stall_sentinel as *const Writer as *mut Writer
    }

    #[cfg(test)]
    pub fn queued_writers(&self) -> usize {
        self.queued_writers.load(Ordering::Relaxed)
    }

    /// Raise the WAL-phase sequence tracker to at least `seq`, returning
    /// the resulting value.
    pub fn update_last_sequence(&self, seq: SequenceNumber) -> SequenceNumber {
        let mut current = self.last_sequence.load(Ordering::Acquire);
        while current < seq {
            match self.last_sequence.compare_exchange_weak(
                current,
                seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return seq,
                Err(observed) => current = observed,
            }
        }
        current
    }

    // =========================================================================
    // State transitions and parking
    // =========================================================================

    /// Move `w` to `new_state`, waking it if it claimed its parking slot.
    fn set_state(&self, w: *mut Writer, new_state: u8) {
        unsafe {
            let state = (*w).state.load(Ordering::Acquire);
            if state == STATE_LOCKED_WAITING
                || (*w)
                    .state
                    .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                // The writer claimed (or is claiming) LOCKED_WAITING; its
                // mutex is the only safe place to publish the new state.
                let guard = (*w).state_mutex.lock();
                (*w).state.store(new_state, Ordering::Release);
                (*w).state_cv.notify_one();
                drop(guard);
            }
        }
    }

    /// Block until the writer's state intersects `goal_mask`; returns the
    /// observed state.
    fn await_state(&self, w: *mut Writer, goal_mask: u8) -> u8 {
        unsafe {
            for _ in 0..AWAIT_SPIN_ITERATIONS {
                let state = (*w).state.load(Ordering::Acquire);
                if state & goal_mask != 0 {
                    return state;
                }
                std::hint::spin_loop();
            }
            self.blocking_await_state(w, goal_mask)
        }
    }

    unsafe fn blocking_await_state(&self, w: *mut Writer, goal_mask: u8) -> u8 {
        let mut state = (*w).state.load(Ordering::Acquire);
        debug_assert_ne!(state, STATE_LOCKED_WAITING);
        if state & goal_mask == 0
            && (*w)
                .state
                .compare_exchange(
                    state,
                    STATE_LOCKED_WAITING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            // The claim succeeded: we own the right (and the duty) to sleep
            // on our own mutex until somebody moves us on.
            let mut guard = (*w).state_mutex.lock();
            loop {
                state = (*w).state.load(Ordering::Acquire);
                if state != STATE_LOCKED_WAITING {
                    break;
                }
                (*w).state_cv.wait(&mut guard);
            }
        } else {
            state = (*w).state.load(Ordering::Acquire);
        }
        debug_assert_ne!(state & goal_mask, 0);
        state
    }

    // =========================================================================
    // Linking
    // =========================================================================

    /// Append `w` at the newest end. Blocks while a stall barrier is up
    /// (failing fast instead when the writer asked for no slowdown).
    fn link_one(&self, w: *mut Writer, newest: &AtomicPtr<Writer>) -> LinkOutcome {
        let is_main_queue = ptr::eq(newest, &self.newest_writer);
        let mut head = newest.load(Ordering::Acquire);
        loop {
            if is_main_queue && head == self.stall_sentinel_ptr() {
                unsafe {
                    if (*w).no_slowdown {
                        (*w).status = Err(EmberError::Incomplete("Write stall".into()));
                        self.set_state(w, STATE_COMPLETED);
                        return LinkOutcome::Rejected;
                    }
                }
                let mut guard = self.stall_mu.lock();
                head = newest.load(Ordering::Acquire);
                if head == self.stall_sentinel_ptr() {
                    self.stall_cv.wait(&mut guard);
                    head = newest.load(Ordering::Acquire);
                }
                continue;
            }
            unsafe {
                (*w).link_older = head;
            }
            match newest.compare_exchange_weak(head, w, Ordering::SeqCst, Ordering::Acquire) {
                Ok(_) => {
                    return if head.is_null() {
                        LinkOutcome::Leader
                    } else {
                        LinkOutcome::Follower
                    };
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// Re-link a whole group (already chained through `link_older`) at the
    /// newest end of `newest`, preserving internal order. Returns whether
    /// the group's leader became the queue head.
    fn link_group(&self, group: &mut WriteGroup, newest: &AtomicPtr<Writer>) -> bool {
        unsafe {
            let leader = group.leader;
            let last_writer = group.last_writer;
            let mut w = last_writer;
            loop {
                // Clear stale newer links so the next leader walk rebuilds
                // them, and detach from the old group.
                (*w).link_newer = ptr::null_mut();
                (*w).write_group = ptr::null_mut();
                if w == leader {
                    break;
                }
                w = (*w).link_older;
            }
            let mut head = newest.load(Ordering::Acquire);
            loop {
                (*leader).link_older = head;
                match newest.compare_exchange_weak(
                    head,
                    last_writer,
                    Ordering::SeqCst,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return head.is_null(),
                    Err(observed) => head = observed,
                }
            }
        }
    }

    /// Walk backwards from `head`, filling in `link_newer` until an already
    /// linked node (or the queue's oldest writer) is reached. Only the
    /// current leader runs this, so the plain stores need no synchronization
    /// beyond the acquire load of `head`.
    fn create_missing_newer_links(&self, mut head: *mut Writer) {
        unsafe {
            loop {
                let next = (*head).link_older;
                if next.is_null() || !(*next).link_newer.is_null() {
                    debug_assert!(next.is_null() || (*next).link_newer == head);
                    break;
                }
                (*next).link_newer = head;
                head = next;
            }
        }
    }

    /// Oldest writer strictly newer than `boundary`, walking older links
    /// from `from`.
    fn find_next_leader(&self, from: *mut Writer, boundary: *mut Writer) -> *mut Writer {
        unsafe {
            let mut current = from;
            while (*current).link_older != boundary {
                current = (*current).link_older;
                debug_assert!(!current.is_null());
            }
            current
        }
    }

    // =========================================================================
    // Joining and leading
    // =========================================================================

    /// Enqueue `w` and either promote it to leader or park it until a
    /// leader hands it a role.
    pub fn join_batch_group(&self, w: *mut Writer) {
        unsafe {
            debug_assert!((*w).batch.is_some());
        }
        // Count the arrival before it becomes visible to a leader: exits
        // subtract whole groups, and a writer claimed-and-exited before its
        // own increment would drive the counter negative.
        self.queued_writers.fetch_add(1, Ordering::Relaxed);
        match self.link_one(w, &self.newest_writer) {
            LinkOutcome::Leader => {
                self.set_state(w, STATE_GROUP_LEADER);
            }
            LinkOutcome::Follower => {
                self.await_state(
                    w,
                    STATE_GROUP_LEADER
                        | STATE_MEMTABLE_WRITER_LEADER
                        | STATE_PARALLEL_MEMTABLE_WRITER
                        | STATE_COMPLETED,
                );
            }
            LinkOutcome::Rejected => {
                self.queued_writers.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Group byte budget: grows with the size of recent groups but is
    /// capped by queue pressure so a burst of small writers is not made to
    /// wait for one giant group.
    fn max_group_bytes(&self) -> u64 {
        let base = self.max_write_batch_group_size_bytes;
        let recent = self.last_group_bytes.load(Ordering::Relaxed);
        let queued = self.queued_writers.load(Ordering::Relaxed).max(1) as u64;
        base.max((base + recent / 8).min(128 * 1024 * queued))
    }

    /// Claim the consecutive run of compatible followers behind `leader`.
    /// Returns the group's total byte size.
    pub fn enter_as_batch_group_leader(
        &self,
        leader: *mut Writer,
        group: &mut WriteGroup,
    ) -> u64 {
        unsafe {
            debug_assert!((*leader).batch.is_some());
            let mut size = (*leader).batch_byte_size();
            let max_size = self.max_group_bytes();

            (*leader).write_group = group;
            group.leader = leader;
            group.last_writer = leader;
            group.size = 1;

            let newest = self.newest_writer.load(Ordering::Acquire);
            self.create_missing_newer_links(newest);

            let mut w = leader;
            while w != newest {
                w = (*w).link_newer;
                if (*w).sync && !(*leader).sync {
                    // A sync write cannot ride a non-sync group.
                    break;
                }
                if (*w).no_slowdown != (*leader).no_slowdown {
                    break;
                }
                if (*w).disable_wal != (*leader).disable_wal {
                    break;
                }
                if (*w).batch.is_none() {
                    // Unbatched writers demand exclusive passage.
                    break;
                }
                if (*w).callback.is_some()
                    && !(*w).callback.as_ref().unwrap().allow_write_batching()
                {
                    break;
                }
                if (*leader).callback.is_some()
                    && !(*leader).callback.as_ref().unwrap().allow_write_batching()
                {
                    // Leader's callback forbids batching: the group stays
                    // at size one.
                    break;
                }
                let batch_size = (*w).batch_byte_size();
                if size + batch_size > max_size {
                    break;
                }
                size += batch_size;
                (*w).write_group = group;
                group.last_writer = w;
                group.size += 1;
            }
            self.last_group_bytes.store(size, Ordering::Relaxed);
            size
        }
    }

    /// Hand every group member (leader included) to the parallel memtable
    /// phase and wake the followers.
    pub fn launch_parallel_memtable_writers(&self, group: &mut WriteGroup) {
        group.running.store(group.size, Ordering::SeqCst);
        // Snapshot the membership first: the instant a follower wakes it
        // may start mutating its own links.
        let members: SmallVec<[*mut Writer; 8]> = unsafe { group.iter().collect() };
        for w in members {
            self.set_state(w, STATE_PARALLEL_MEMTABLE_WRITER);
        }
    }

    /// Report one parallel applier done. Returns true for exactly one
    /// caller — the last to finish — who then owes the group exit. Everyone
    /// else parks until the winner completes them.
    pub fn complete_parallel_memtable_writer(&self, w: *mut Writer) -> bool {
        unsafe {
            let group = &mut *(*w).write_group;
            if (*w).status.is_err() {
                let mut status = group.status.lock();
                if status.is_ok() {
                    *status = (*w).status.clone();
                }
            }
            if group.running.fetch_sub(1, Ordering::AcqRel) > 1 {
                self.await_state(w, STATE_COMPLETED);
                return false;
            }
            (*w).status = group.status.lock().clone();
            true
        }
    }

    /// Winner-side exit for a follower that finished last: close out the
    /// group and complete the leader.
    pub fn exit_as_batch_group_follower(&self, w: *mut Writer) {
        unsafe {
            let group = &mut *(*w).write_group;
            debug_assert_eq!((*w).state(), STATE_PARALLEL_MEMTABLE_WRITER);
            let leader = group.leader;
            let status = group.status.lock().clone();
            self.exit_as_batch_group_leader(group, status);
            debug_assert_eq!((*w).state(), STATE_COMPLETED);
            self.set_state(leader, STATE_COMPLETED);
        }
    }

    /// Remove one fully finished member from a pipelined group before the
    /// rest moves to the memtable queue.
    fn complete_leader(&self, group: &mut WriteGroup) {
        unsafe {
            debug_assert!(group.size > 0);
            let leader = group.leader;
            if group.size == 1 {
                group.leader = ptr::null_mut();
                group.last_writer = ptr::null_mut();
            } else {
                debug_assert!(!(*leader).link_newer.is_null());
                (*(*leader).link_newer).link_older = ptr::null_mut();
                group.leader = (*leader).link_newer;
            }
            group.size -= 1;
            self.queued_writers.fetch_sub(1, Ordering::Relaxed);
            self.set_state(leader, STATE_COMPLETED);
        }
    }

    fn complete_follower(&self, w: *mut Writer, group: &mut WriteGroup) {
        unsafe {
            debug_assert!(group.size > 1);
            debug_assert!(w != group.leader);
            if w == group.last_writer {
                (*(*w).link_older).link_newer = ptr::null_mut();
                group.last_writer = (*w).link_older;
            } else {
                (*(*w).link_older).link_newer = (*w).link_newer;
                (*(*w).link_newer).link_older = (*w).link_older;
            }
            group.size -= 1;
            self.queued_writers.fetch_sub(1, Ordering::Relaxed);
            self.set_state(w, STATE_COMPLETED);
        }
    }

    /// Close the group: stamp every member's status, wake them, advance the
    /// queue head, and promote the next leader. In pipelined mode the
    /// members that still need a memtable phase are re-linked onto the
    /// memtable queue instead of completing here.
    pub fn exit_as_batch_group_leader(&self, group: &mut WriteGroup, mut status: Result<()>) {
        unsafe {
            let leader = group.leader;
            let mut last_writer = group.last_writer;
            debug_assert!((*leader).link_older.is_null());

            {
                let group_status = group.status.lock();
                if status.is_ok() && group_status.is_err() {
                    status = group_status.clone();
                }
            }

            if self.enable_pipelined_write {
                // Complete the members with nothing left to do before the
                // survivors move queues.
                let mut w = last_writer;
                while w != leader {
                    let next = (*w).link_older;
                    (*w).status = status.clone();
                    if !(*w).should_write_to_memtable() {
                        self.complete_follower(w, group);
                    }
                    w = next;
                }
                if !(*leader).should_write_to_memtable() {
                    self.complete_leader(group);
                }

                let mut next_leader: *mut Writer = ptr::null_mut();

                // Pin the boundary of this group with a dummy node so
                // writers arriving during the hand-off cannot overtake the
                // group on its way to the memtable queue.
                let mut dummy = Writer::empty();
                let dummy_ptr = &mut dummy as *mut Writer;
                let mut expected = last_writer;
                let has_dummy = self
                    .newest_writer
                    .compare_exchange(expected, dummy_ptr, Ordering::SeqCst, Ordering::Acquire)
                    .map_err(|observed| expected = observed)
                    .is_ok();
                if !has_dummy {
                    self.create_missing_newer_links(expected);
                    next_leader = self.find_next_leader(expected, last_writer);
                    debug_assert!(!next_leader.is_null() && next_leader != last_writer);
                }

                if group.size > 0 {
                    if self.link_group(group, &self.newest_memtable_writer) {
                        // The group's (possibly reduced) leader owns the
                        // memtable phase now.
                        self.set_state(group.leader, STATE_MEMTABLE_WRITER_LEADER);
                    }
                }

                if has_dummy {
                    debug_assert!(next_leader.is_null());
                    let mut expected = dummy_ptr;
                    let has_pending = self
                        .newest_writer
                        .compare_exchange(
                            expected,
                            ptr::null_mut(),
                            Ordering::SeqCst,
                            Ordering::Acquire,
                        )
                        .map_err(|observed| expected = observed)
                        .is_err();
                    if has_pending {
                        self.create_missing_newer_links(expected);
                        next_leader = self.find_next_leader(expected, dummy_ptr);
                        debug_assert!(!next_leader.is_null() && next_leader != dummy_ptr);
                    }
                }

                if !next_leader.is_null() {
                    (*next_leader).link_older = ptr::null_mut();
                    self.set_state(next_leader, STATE_GROUP_LEADER);
                }

                self.await_state(
                    leader,
                    STATE_MEMTABLE_WRITER_LEADER
                        | STATE_PARALLEL_MEMTABLE_WRITER
                        | STATE_COMPLETED,
                );
            } else {
                let mut head = self.newest_writer.load(Ordering::Acquire);
                if head != last_writer
                    || self
                        .newest_writer
                        .compare_exchange(
                            last_writer,
                            ptr::null_mut(),
                            Ordering::SeqCst,
                            Ordering::Acquire,
                        )
                        .map_err(|observed| head = observed)
                        .is_err()
                {
                    // Somebody linked behind the group; cut them loose and
                    // crown the oldest of them.
                    debug_assert!(head != last_writer);
                    self.create_missing_newer_links(head);
                    debug_assert!((*(*last_writer).link_newer).link_older == last_writer);
                    (*(*last_writer).link_newer).link_older = ptr::null_mut();
                    self.set_state((*last_writer).link_newer, STATE_GROUP_LEADER);
                }

                let size = group.size;
                while last_writer != leader {
                    (*last_writer).status = status.clone();
                    // Read the link before waking: the instant a follower
                    // observes COMPLETED its stack frame may be gone.
                    let next = (*last_writer).link_older;
                    self.set_state(last_writer, STATE_COMPLETED);
                    last_writer = next;
                }
                self.queued_writers.fetch_sub(size, Ordering::Relaxed);
            }
        }
    }

    // =========================================================================
    // Pipelined memtable queue
    // =========================================================================

    /// Form the memtable-phase group: the leader plus, unless merges or the
    /// concurrency setting forbid it, the compatible run behind it.
    pub fn enter_as_memtable_writer(&self, leader: *mut Writer, group: &mut WriteGroup) {
        unsafe {
            debug_assert!(!leader.is_null() && (*leader).link_older.is_null());
            debug_assert!((*leader).batch.is_some());

            let mut size = (*leader).batch_byte_size();
            let max_size = self.max_group_bytes();

            (*leader).write_group = group;
            group.leader = leader;
            group.size = 1;
            let mut last_writer = leader;

            let leader_has_merge = (*leader)
                .batch
                .as_ref()
                .map(|b| b.has_merge())
                .unwrap_or(false);
            if !self.allow_concurrent_memtable_write || !leader_has_merge {
                let newest = self.newest_memtable_writer.load(Ordering::Acquire);
                self.create_missing_newer_links(newest);

                let mut w = leader;
                while w != newest {
                    w = (*w).link_newer;
                    if (*w).batch.is_none() {
                        break;
                    }
                    let has_merge = (*w).batch.as_ref().map(|b| b.has_merge()).unwrap_or(false);
                    if has_merge {
                        break;
                    }
                    if !self.allow_concurrent_memtable_write {
                        let batch_size = (*w).batch_byte_size();
                        if size + batch_size > max_size {
                            break;
                        }
                        size += batch_size;
                    }
                    (*w).write_group = group;
                    last_writer = w;
                    group.size += 1;
                }
            }

            group.last_writer = last_writer;
            group.last_sequence = ((*last_writer).sequence
                + (*last_writer).batch_count() as u64)
                .saturating_sub(1);
        }
    }

    /// Finish the memtable phase: promote the next memtable leader and
    /// complete every member, the leader last since it owns the group.
    pub fn exit_as_memtable_writer(&self, group: &mut WriteGroup) {
        unsafe {
            let leader = group.leader;
            let last_writer = group.last_writer;

            let mut expected = last_writer;
            if self
                .newest_memtable_writer
                .compare_exchange(expected, ptr::null_mut(), Ordering::SeqCst, Ordering::Acquire)
                .map_err(|observed| expected = observed)
                .is_err()
            {
                self.create_missing_newer_links(expected);
                let next_leader = self.find_next_leader(expected, last_writer);
                debug_assert!(!next_leader.is_null());
                (*next_leader).link_older = ptr::null_mut();
                self.set_state(next_leader, STATE_MEMTABLE_WRITER_LEADER);
            }

            let size = group.size;
            let group_status = group.status.lock().clone();
            let mut w = leader;
            loop {
                if group_status.is_err() && (*w).status.is_ok() {
                    (*w).status = group_status.clone();
                }
                let next = (*w).link_newer;
                let is_last = w == last_writer;
                if w != leader {
                    self.set_state(w, STATE_COMPLETED);
                }
                if is_last {
                    break;
                }
                w = next;
            }
            self.queued_writers.fetch_sub(size, Ordering::Relaxed);
            self.set_state(leader, STATE_COMPLETED);
        }
    }

    /// Block until the pipelined memtable queue drains. Used by unbatched
    /// passage and by leaders whose callback forbids batching.
    pub fn wait_for_memtable_writers(&self) {
        debug_assert!(self.enable_pipelined_write);
        if self.newest_memtable_writer.load(Ordering::Acquire).is_null() {
            return;
        }
        let mut w = Writer::empty();
        let w_ptr = &mut w as *mut Writer;
        if !matches!(
            self.link_one(w_ptr, &self.newest_memtable_writer),
            LinkOutcome::Leader
        ) {
            self.await_state(w_ptr, STATE_MEMTABLE_WRITER_LEADER);
        }
        self.newest_memtable_writer
            .store(ptr::null_mut(), Ordering::Release);
    }

    // =========================================================================
    // Unbatched passage
    // =========================================================================

    /// Exclusive passage for a batchless writer (the memtable switch).
    /// Caller must NOT hold the global mutex; re-acquire it after this
    /// returns with `w` at the head of the queue.
    pub fn enter_unbatched(&self, w: *mut Writer) {
        unsafe {
            debug_assert!((*w).batch.is_none());
        }
        self.queued_writers.fetch_add(1, Ordering::Relaxed);
        let linked_as_leader = matches!(
            self.link_one(w, &self.newest_writer),
            LinkOutcome::Leader
        );
        if !linked_as_leader {
            // The previous leader will not batch us: no batch, no group.
            self.await_state(w, STATE_GROUP_LEADER);
        }
        if self.enable_pipelined_write {
            self.wait_for_memtable_writers();
        }
    }

    pub fn exit_unbatched(&self, w: *mut Writer) {
        unsafe {
            let mut expected = w;
            if self
                .newest_writer
                .compare_exchange(expected, ptr::null_mut(), Ordering::SeqCst, Ordering::Acquire)
                .map_err(|observed| expected = observed)
                .is_err()
            {
                self.create_missing_newer_links(expected);
                let next_leader = self.find_next_leader(expected, w);
                debug_assert!(!next_leader.is_null());
                (*next_leader).link_older = ptr::null_mut();
                self.set_state(next_leader, STATE_GROUP_LEADER);
            }
            self.queued_writers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    // =========================================================================
    // Write stalls
    // =========================================================================

    /// Raise the stall barrier: new writers park at the sentinel, and any
    /// already-queued writer that asked for no slowdown fails immediately.
    /// Caller holds the global mutex.
    pub fn begin_write_stall(&self) {
        let sentinel = self.stall_sentinel_ptr();
        unsafe {
            (*sentinel).link_older = ptr::null_mut();
            (*sentinel).link_newer = ptr::null_mut();
        }
        self.link_one(sentinel, &self.newest_writer);
        unsafe {
            // Fail queued no_slowdown writers that are not yet claimed by a
            // group; the current group never mixes slowdown policies.
            let mut prev = sentinel;
            let mut w = (*sentinel).link_older;
            while !w.is_null() && (*w).write_group.is_null() {
                if (*w).no_slowdown {
                    (*prev).link_older = (*w).link_older;
                    (*w).status = Err(EmberError::Incomplete("Write stall".into()));
                    self.queued_writers.fetch_sub(1, Ordering::Relaxed);
                    self.set_state(w, STATE_COMPLETED);
                    w = (*prev).link_older;
                } else {
                    prev = w;
                    w = (*w).link_older;
                }
            }
        }
    }

    /// Exact number of writers currently linked (stall sentinel included),
    /// observed by walking the list. Only meaningful while no leader is
    /// exiting, which tests arrange explicitly.
    #[cfg(test)]
    fn linked_len(&self) -> usize {
        let mut len = 0;
        let mut node = self.newest_writer.load(Ordering::Acquire);
        while !node.is_null() {
            len += 1;
            node = unsafe { (*node).link_older };
        }
        len
    }

    /// Drop the stall barrier and wake everyone parked at it. Caller holds
    /// the global mutex.
    pub fn end_write_stall(&self) {
        let sentinel = self.stall_sentinel_ptr();
        let guard = self.stall_mu.lock();
        unsafe {
            // New arrivals park at the sentinel rather than linking past it,
            // so it is still the queue head.
            debug_assert_eq!(self.newest_writer.load(Ordering::Acquire), sentinel);
            let older = (*sentinel).link_older;
            if !older.is_null() {
                (*older).link_newer = ptr::null_mut();
            }
            self.newest_writer.store(older, Ordering::SeqCst);
        }
        drop(guard);
        self.stall_cv.notify_all();
    }
}
