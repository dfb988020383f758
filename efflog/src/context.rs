//! 进程级执行上下文
//!
//! 全局唯一的 Executor 容器，惰性初始化且与进程同生命周期，
//! 所有 sink 共用一套定时器和 runner 注册表。

use std::sync::OnceLock;

use crate::executor::{Executor, TaskRunnerTag};

pub struct Context {
    executor: Executor,
}

impl Context {
    /// 全局实例
    pub fn instance() -> &'static Context {
        static CONTEXT: OnceLock<Context> = OnceLock::new();
        CONTEXT.get_or_init(|| Context {
            executor: Executor::new(),
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn create_task_runner(&self) -> TaskRunnerTag {
        self.executor.create_task_runner()
    }
}
