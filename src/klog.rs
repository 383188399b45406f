//! 内核日志
//!
//! 通过 `log` 门面输出。控制台驱动用 [`init`] 注册输出函数，
//! 注册之前的日志直接丢弃。

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::spinlock::SpinLock;

/// 把一条格式化好的日志写到控制台
pub type Sink = fn(fmt::Arguments<'_>);

/// 开始 panic 之后置位，此后输出不再加锁
pub static PANICKED: AtomicBool = AtomicBool::new(false);

struct KernelLogger {
    sink: SpinLock<Option<Sink>>,
}

static LOGGER: KernelLogger = KernelLogger {
    sink: SpinLock::new(None, "klog"),
};

/// 注册输出函数并设置最高日志级别
pub fn init(sink: Sink, level: LevelFilter) -> Result<(), SetLoggerError> {
    *LOGGER.sink.lock() = Some(sink);
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if PANICKED.load(Ordering::Relaxed) {
            // no need to lock
            if let Some(sink) = unsafe { *self.sink.get_unchecked() } {
                sink(format_args!("[{}] {}: {}\n", record.level(), record.target(), record.args()));
            }
            return;
        }

        let guard = self.sink.lock();
        if let Some(sink) = *guard {
            sink(format_args!("[{}] {}: {}\n", record.level(), record.target(), record.args()));
        }
        drop(guard);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    static OUTPUT: Mutex<String> = Mutex::new(String::new());

    fn capture(args: fmt::Arguments<'_>) {
        use core::fmt::Write;
        let mut out = OUTPUT.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = out.write_fmt(args);
    }

    #[test]
    fn records_reach_the_sink() {
        init(capture, LevelFilter::Info).unwrap();
        log::warn!(target: "klog-test", "pid {} killed", 3);
        log::debug!(target: "klog-test", "hidden");

        let out = OUTPUT.lock().unwrap();
        assert!(out.contains("[WARN] klog-test: pid 3 killed\n"));
        assert!(!out.contains("hidden"));
    }
}
