//! 任务执行器
//!
//! 两个协作的执行体：
//! - TaskRunner: 单线程 FIFO 队列，同一 runner 上的任务串行且不并发
//! - ExecutorTimer: 最小堆定时器，支持延时任务和可取消的重复任务
//!
//! Executor 持有 runner 注册表和定时器，按 tag 路由任务。

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

pub type Task = Box<dyn FnOnce() + Send + 'static>;
/// runner 句柄，稠密整数
pub type TaskRunnerTag = u64;
/// 重复任务句柄
pub type RepeatedTaskId = u64;

struct RunnerInner {
    queue: VecDeque<Task>,
    running: bool,
}

struct RunnerState {
    inner: Mutex<RunnerInner>,
    cv: Condvar,
}

/// 单线程顺序执行器
struct TaskRunner {
    state: Arc<RunnerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    fn new(tag: TaskRunnerTag) -> Self {
        let state = Arc::new(RunnerState {
            inner: Mutex::new(RunnerInner {
                queue: VecDeque::new(),
                running: true,
            }),
            cv: Condvar::new(),
        });

        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name(format!("efflog-runner-{tag}"))
            .spawn(move || Self::run(worker_state))
            .ok();

        Self {
            state,
            worker: Mutex::new(worker),
        }
    }

    fn run(state: Arc<RunnerState>) {
        loop {
            let task = {
                let mut inner = state.inner.lock();
                while inner.running && inner.queue.is_empty() {
                    state.cv.wait(&mut inner);
                }
                // 停止前排空队列
                if inner.queue.is_empty() {
                    return;
                }
                inner.queue.pop_front()
            };
            if let Some(task) = task {
                task();
            }
        }
    }

    fn submit(&self, task: Task) {
        {
            let mut inner = self.state.inner.lock();
            if !inner.running {
                warn!("TaskRunner::submit: runner already stopped, task dropped");
                return;
            }
            inner.queue.push_back(task);
        }
        self.state.cv.notify_one();
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        {
            let mut inner = self.state.inner.lock();
            inner.running = false;
        }
        self.state.cv.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

enum TimerJob {
    Once(Task),
    Repeated {
        tick: Arc<dyn Fn() + Send + Sync>,
        interval: Duration,
        remaining: u64,
        id: RepeatedTaskId,
    },
}

struct ScheduledTask {
    when: Instant,
    seq: u64,
    job: TimerJob,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // BinaryHeap 是大顶堆，反转比较得到最早到期在顶
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerInner {
    queue: BinaryHeap<ScheduledTask>,
    running: bool,
}

struct TimerState {
    inner: Mutex<TimerInner>,
    cv: Condvar,
    live_ids: Mutex<HashSet<RepeatedTaskId>>,
    next_seq: AtomicU64,
}

impl TimerState {
    fn schedule(&self, when: Instant, job: TimerJob) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            inner.queue.push(ScheduledTask { when, seq, job });
        }
        self.cv.notify_all();
    }
}

/// 定时器，单工作线程消费最小堆
struct ExecutorTimer {
    state: Arc<TimerState>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorTimer {
    fn new() -> Self {
        let state = Arc::new(TimerState {
            inner: Mutex::new(TimerInner {
                queue: BinaryHeap::new(),
                running: true,
            }),
            cv: Condvar::new(),
            live_ids: Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(0),
        });

        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name("efflog-timer".into())
            .spawn(move || Self::run(worker_state))
            .ok();

        Self {
            state,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(worker),
        }
    }

    fn run(state: Arc<TimerState>) {
        loop {
            let due = {
                let mut inner = state.inner.lock();
                loop {
                    if !inner.running {
                        return;
                    }
                    match inner.queue.peek() {
                        None => state.cv.wait(&mut inner),
                        Some(next) => {
                            let now = Instant::now();
                            if next.when <= now {
                                break;
                            }
                            // 新的更早截止时间会通过 notify 提前唤醒
                            let timeout = next.when - now;
                            state.cv.wait_for(&mut inner, timeout);
                        }
                    }
                }
                inner.queue.pop()
            };

            let Some(entry) = due else { continue };
            match entry.job {
                TimerJob::Once(task) => task(),
                TimerJob::Repeated {
                    tick,
                    interval,
                    remaining,
                    id,
                } => {
                    if !state.live_ids.lock().contains(&id) {
                        continue;
                    }
                    tick();

                    let next_remaining = if remaining == u64::MAX {
                        remaining
                    } else {
                        remaining - 1
                    };
                    if next_remaining == 0 {
                        state.live_ids.lock().remove(&id);
                        continue;
                    }
                    state.schedule(
                        Instant::now() + interval,
                        TimerJob::Repeated {
                            tick,
                            interval,
                            remaining: next_remaining,
                            id,
                        },
                    );
                }
            }
        }
    }

    fn post_delayed(&self, task: Task, delay: Duration) {
        self.state
            .schedule(Instant::now() + delay, TimerJob::Once(task));
    }

    fn post_repeated(
        &self,
        tick: Arc<dyn Fn() + Send + Sync>,
        interval: Duration,
        count: u64,
    ) -> RepeatedTaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if count == 0 {
            return id;
        }
        self.state.live_ids.lock().insert(id);
        self.state.schedule(
            Instant::now() + interval,
            TimerJob::Repeated {
                tick,
                interval,
                remaining: count,
                id,
            },
        );
        id
    }

    fn cancel_repeated(&self, id: RepeatedTaskId) {
        // 仅从存活集合移除，堆里已排队的一次触发会在出队时被跳过
        self.state.live_ids.lock().remove(&id);
    }
}

impl Drop for ExecutorTimer {
    fn drop(&mut self) {
        {
            let mut inner = self.state.inner.lock();
            inner.running = false;
        }
        self.state.cv.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

struct TaskRunnerManager {
    runners: Mutex<HashMap<TaskRunnerTag, Arc<TaskRunner>>>,
    next_tag: AtomicU64,
}

impl TaskRunnerManager {
    fn new() -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
        }
    }

    fn create(&self) -> TaskRunnerTag {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let runner = Arc::new(TaskRunner::new(tag));
        self.runners.lock().insert(tag, runner);
        tag
    }

    fn get(&self, tag: TaskRunnerTag) -> Option<Arc<TaskRunner>> {
        self.runners.lock().get(&tag).cloned()
    }
}

/// 任务执行结果句柄
pub struct TaskFuture<R> {
    rx: mpsc::Receiver<R>,
}

impl<R> TaskFuture<R> {
    /// 阻塞等待结果；执行器停止导致任务未运行时返回 None
    pub fn wait(self) -> Option<R> {
        self.rx.recv().ok()
    }
}

/// 调度器门面
pub struct Executor {
    runners: TaskRunnerManager,
    timer: ExecutorTimer,
}

impl Executor {
    pub(crate) fn new() -> Self {
        Self {
            runners: TaskRunnerManager::new(),
            timer: ExecutorTimer::new(),
        }
    }

    /// 新建一个单线程 runner
    pub fn create_task_runner(&self) -> TaskRunnerTag {
        self.runners.create()
    }

    /// 投递任务到指定 runner，FIFO 串行执行
    pub fn post<F>(&self, tag: TaskRunnerTag, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.runners.get(tag) {
            Some(runner) => runner.submit(Box::new(task)),
            None => warn!("Executor::post: unknown task runner tag {tag}"),
        }
    }

    /// 投递任务并取回返回值
    pub fn post_with_result<F, R>(&self, tag: TaskRunnerTag, task: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.post(tag, move || {
            let _ = tx.send(task());
        });
        TaskFuture { rx }
    }

    /// 投递空任务并等待其完成，作为该 runner 的同步屏障
    pub fn post_and_wait_idle(&self, tag: TaskRunnerTag) {
        let _ = self.post_with_result(tag, || {}).wait();
    }

    /// 延时后投递到指定 runner
    pub fn post_delayed<F>(&self, tag: TaskRunnerTag, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(runner) = self.runners.get(tag) else {
            warn!("Executor::post_delayed: unknown task runner tag {tag}");
            return;
        };
        self.timer
            .post_delayed(Box::new(move || runner.submit(Box::new(task))), delay);
    }

    /// 按固定间隔重复投递，首次触发在 interval 之后；
    /// count 为 u64::MAX 表示不限次数
    pub fn post_repeated<F>(
        &self,
        tag: TaskRunnerTag,
        task: F,
        interval: Duration,
        count: u64,
    ) -> RepeatedTaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let Some(runner) = self.runners.get(tag) else {
            warn!("Executor::post_repeated: unknown task runner tag {tag}");
            return 0;
        };
        let task = Arc::new(task);
        let tick = Arc::new(move || {
            let task = Arc::clone(&task);
            runner.submit(Box::new(move || task()));
        });
        self.timer.post_repeated(tick, interval, count)
    }

    /// 取消重复任务，已经入队的触发不追回
    pub fn cancel_repeated(&self, id: RepeatedTaskId) {
        self.timer.cancel_repeated(id);
    }
}
