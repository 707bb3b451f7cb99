// Lazy SMP thread pool.
//
// Each helper thread runs in its own OS thread with a dedicated
// SearchWorker, woken through a Condvar idle loop. Helpers share only the
// transposition table, the stop flag and the breadcrumb table; everything
// else is thread-local. Oversized stacks because the search recursion is
// deep near MAX_PLY.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::position::Position;
use crate::search::alpha_beta::SearchWorker;
use crate::search::engine::iterative_deepening;
use crate::search::limits::LimitsType;
use crate::search::tb::SyzygyTb;
use crate::search::types::RootMoves;
use crate::search::SearchOptions;
use crate::tt::TranspositionTable;
use crate::types::Depth;

const SEARCH_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Helper-thread progress visible to the main thread without locking the
/// worker. Updated once per completed iteration.
pub struct SearchProgress {
    nodes: AtomicU64,
    best_move_changes_bits: AtomicU64,
}

impl SearchProgress {
    pub fn new() -> Self {
        Self {
            nodes: AtomicU64::new(0),
            best_move_changes_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    pub fn reset(&self) {
        self.nodes.store(0, Ordering::Relaxed);
        self.best_move_changes_bits
            .store(0.0f64.to_bits(), Ordering::Relaxed);
    }

    pub fn update(&self, nodes: u64, best_move_changes: f64) {
        self.nodes.store(nodes, Ordering::Relaxed);
        self.best_move_changes_bits
            .store(best_move_changes.to_bits(), Ordering::Relaxed);
    }

    pub fn nodes(&self) -> u64 {
        self.nodes.load(Ordering::Relaxed)
    }

    pub fn best_move_changes(&self) -> f64 {
        f64::from_bits(self.best_move_changes_bits.load(Ordering::Relaxed))
    }

    pub fn take_best_move_changes(&self) -> f64 {
        let bits = self
            .best_move_changes_bits
            .swap(0.0f64.to_bits(), Ordering::Relaxed);
        f64::from_bits(bits)
    }
}

impl Default for SearchProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SearchTask {
    pub pos: Position,
    pub limits: LimitsType,
    pub options: SearchOptions,
    pub tb: Option<Arc<SyzygyTb>>,
    pub tb_cardinality: i32,
    pub tb_probe_depth: Depth,
    pub tb_use_rule50: bool,
    pub root_in_tb: bool,
    pub root_moves: RootMoves,
}

enum ThreadTask {
    Search(Box<SearchTask>),
    ClearHistories,
}

struct ThreadState {
    searching: bool,
    exit: bool,
    task: Option<ThreadTask>,
}

struct ThreadInner {
    worker: Mutex<Box<SearchWorker>>,
    state: Mutex<ThreadState>,
    condvar: Condvar,
    progress: Arc<SearchProgress>,
}

pub struct Thread {
    id: usize,
    inner: Arc<ThreadInner>,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    fn new(
        id: usize,
        tt: Arc<TranspositionTable>,
        stop: Arc<AtomicBool>,
        ponder: Arc<AtomicBool>,
        increase_depth: Arc<AtomicBool>,
    ) -> Self {
        let worker = SearchWorker::new(id, tt, stop, ponder, increase_depth);
        let progress = Arc::new(SearchProgress::new());
        let inner = Arc::new(ThreadInner {
            worker: Mutex::new(worker),
            state: Mutex::new(ThreadState {
                searching: true,
                exit: false,
                task: None,
            }),
            condvar: Condvar::new(),
            progress,
        });
        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .stack_size(SEARCH_STACK_SIZE)
            .spawn(move || idle_loop(inner_clone))
            .expect("failed to spawn search helper thread");

        let thread = Self {
            id,
            inner,
            handle: Some(handle),
        };
        thread.wait_for_search_finished();
        thread
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn schedule_task(&self, task: ThreadTask) {
        let mut state = self.inner.state.lock().unwrap();
        while state.searching {
            state = self.inner.condvar.wait(state).unwrap();
        }
        state.task = Some(task);
        state.searching = true;
        self.inner.condvar.notify_one();
    }

    pub fn wait_for_search_finished(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.searching {
            state = self.inner.condvar.wait(state).unwrap();
        }
    }

    pub fn with_worker<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SearchWorker) -> R,
    {
        let mut worker = self.inner.worker.lock().unwrap();
        f(&mut worker)
    }

    pub fn nodes(&self) -> u64 {
        self.inner.progress.nodes()
    }

    pub fn best_move_changes(&self) -> f64 {
        self.inner.progress.best_move_changes()
    }

    pub fn take_best_move_changes(&self) -> f64 {
        self.inner.progress.take_best_move_changes()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.exit = true;
            state.searching = true;
            self.inner.condvar.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn idle_loop(inner: Arc<ThreadInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock().unwrap();
            state.searching = false;
            inner.condvar.notify_all();

            while !state.searching && !state.exit {
                state = inner.condvar.wait(state).unwrap();
            }

            if state.exit {
                return;
            }

            state.task.take()
        };

        match task {
            Some(ThreadTask::Search(task)) => {
                let task = *task;
                inner.progress.reset();
                let mut worker = inner.worker.lock().unwrap();
                worker.prepare_search(&task.options, &task.limits);
                worker.tb = task.tb;
                worker.tb_cardinality = task.tb_cardinality;
                worker.tb_probe_depth = task.tb_probe_depth;
                worker.tb_use_rule50 = task.tb_use_rule50;
                worker.root_in_tb = task.root_in_tb;
                worker.root_moves = task.root_moves;

                let mut pos = task.pos;
                iterative_deepening(&mut worker, &mut pos, None, Some(&inner.progress));
            }
            Some(ThreadTask::ClearHistories) => {
                inner.progress.reset();
                let mut worker = inner.worker.lock().unwrap();
                worker.clear();
            }
            None => {}
        }
    }
}

/// Pool of helper threads (the main thread searches in the caller).
pub struct ThreadPool {
    threads: Vec<Thread>,
    stop: Arc<AtomicBool>,
    ponder: Arc<AtomicBool>,
    increase_depth: Arc<AtomicBool>,
}

impl ThreadPool {
    pub fn new(
        num_threads: usize,
        tt: Arc<TranspositionTable>,
        stop: Arc<AtomicBool>,
        ponder: Arc<AtomicBool>,
        increase_depth: Arc<AtomicBool>,
    ) -> Self {
        let mut pool = Self {
            threads: Vec::new(),
            stop,
            ponder,
            increase_depth,
        };
        pool.set_num_threads(num_threads, tt);
        pool
    }

    pub fn set_num_threads(&mut self, num_threads: usize, tt: Arc<TranspositionTable>) {
        let helper_count = num_threads.saturating_sub(1);
        if helper_count == self.threads.len() {
            return;
        }

        self.wait_for_search_finished();
        self.threads.clear();

        for id in 1..=helper_count {
            self.threads.push(Thread::new(
                id,
                Arc::clone(&tt),
                Arc::clone(&self.stop),
                Arc::clone(&self.ponder),
                Arc::clone(&self.increase_depth),
            ));
        }
    }

    pub fn start_thinking(&self, make_task: impl Fn(usize) -> SearchTask) {
        for thread in &self.threads {
            thread.schedule_task(ThreadTask::Search(Box::new(make_task(thread.id()))));
        }
    }

    pub fn wait_for_search_finished(&self) {
        for thread in &self.threads {
            thread.wait_for_search_finished();
        }
    }

    pub fn clear_histories(&self) {
        for thread in &self.threads {
            thread.schedule_task(ThreadTask::ClearHistories);
        }
        self.wait_for_search_finished();
    }

    pub fn update_tt(&self, tt: Arc<TranspositionTable>) {
        for thread in &self.threads {
            let tt = Arc::clone(&tt);
            thread.with_worker(|worker| {
                worker.tt = tt;
            });
        }
    }

    pub fn helper_threads(&self) -> &[Thread] {
        &self.threads
    }

    /// Sum of helper nodes, from the per-iteration progress snapshots.
    pub fn helper_nodes(&self) -> u64 {
        self.threads
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.nodes()))
    }

    /// Harvest and reset the helpers' best-move-change counters.
    pub fn harvest_best_move_changes(&self) -> f64 {
        self.threads
            .iter()
            .map(|t| t.take_best_move_changes())
            .sum()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len() + 1
    }
}
