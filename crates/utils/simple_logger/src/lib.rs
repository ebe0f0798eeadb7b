#![cfg_attr(not(test), no_std)]

use core::fmt;

use log::{self, Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

/// 日志的输出端，比如 SBI 控制台。一条日志只调用一次
pub trait LogSink: Sync {
    fn write_args(&self, args: fmt::Arguments<'_>);
}

/// a simple logger
struct SimpleLogger {
    clog: LevelFilter,
    sink: &'static dyn LogSink,
}

fn level_color(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}

/// 按 `[LEVEL] message` 的格式写一条带颜色的日志
fn write_record(sink: &dyn LogSink, level: Level, args: fmt::Arguments<'_>) {
    sink.write_args(format_args!(
        "\u{1B}[{}m[{:>5}] {}\u{1B}[0m\n",
        level_color(level),
        level,
        args
    ));
}

/// 解析 `KERNEL_CLOG` 一类的环境变量，无法识别的值一律关闭
pub fn parse_level(s: Option<&str>) -> LevelFilter {
    match s {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.clog >= metadata.level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        write_record(self.sink, record.level(), *record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Once<SimpleLogger> = Once::new();

/// initiate logger
///
/// 级别由编译期环境变量 `KERNEL_CLOG` 决定。重复调用只有第一次生效
pub fn init(sink: &'static dyn LogSink) {
    init_with_level(sink, parse_level(option_env!("KERNEL_CLOG")));
}

pub fn init_with_level(sink: &'static dyn LogSink, clog: LevelFilter) {
    let mut first = false;
    let logger = LOGGER.call_once(|| {
        first = true;
        SimpleLogger { clog, sink }
    });
    if first && log::set_logger(logger).is_ok() {
        log::set_max_level(logger.clog);
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, sync::Mutex};

    use log::{Level, LevelFilter};

    use super::{parse_level, write_record, LogSink};

    struct Capture(Mutex<String>);

    impl LogSink for Capture {
        fn write_args(&self, args: fmt::Arguments<'_>) {
            fmt::write(&mut *self.0.lock().unwrap(), args).unwrap();
        }
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level(Some("ERROR")), LevelFilter::Error);
        assert_eq!(parse_level(Some("TRACE")), LevelFilter::Trace);
        assert_eq!(parse_level(Some("trace")), LevelFilter::Off);
        assert_eq!(parse_level(None), LevelFilter::Off);
    }

    #[test]
    fn record_format() {
        let sink = Capture(Mutex::new(String::new()));
        write_record(&sink, Level::Warn, format_args!("disk {} failed", 3));
        assert_eq!(*sink.0.lock().unwrap(), "\u{1B}[93m[ WARN] disk 3 failed\u{1B}[0m\n");
    }

    #[test]
    fn logs_through_sink() {
        static SINK: Capture = Capture(Mutex::new(String::new()));
        super::init_with_level(&SINK, LevelFilter::Info);
        log::info!("hello {}", "blk");
        log::debug!("filtered");
        let out = SINK.0.lock().unwrap().clone();
        assert!(out.contains("[ INFO] hello blk"));
        assert!(!out.contains("filtered"));
    }
}
