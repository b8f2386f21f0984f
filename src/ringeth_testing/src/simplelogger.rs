/*
Copyright 2025 The Ringeth Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::{Mutex, MutexGuard, Once};
use std::thread::current;

use log::{Level, Log, Metadata, Record, set_logger, set_max_level};

pub static LOGGER: SimpleLogger = SimpleLogger {};
static INITLOGGER: Once = Once::new();

/// Records from other crates are not kept.
const CAPTURED_TARGET_PREFIX: &str = "ringeth";

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub line: Option<u32>,
    pub file: Option<String>,
    pub module_path: Option<String>,
}

static LOGCALLS: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());

fn log_calls() -> MutexGuard<'static, Vec<LogCall>> {
    // a test that panicked while holding the lock must not break the others
    LOGCALLS.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SimpleLogger {}

impl SimpleLogger {
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            set_logger(&LOGGER).unwrap();
            set_max_level(log::LevelFilter::Trace);
        });
    }

    pub fn num_log_calls(&self) -> usize {
        log_calls().len()
    }

    pub fn get_log_call(&self, idx: usize) -> Option<LogCall> {
        log_calls().get(idx).cloned()
    }

    pub fn clear_log_calls(&self) {
        log_calls().clear();
    }

    /// Calls `f` with the captured records, then clears them.
    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        let mut logcalls = log_calls();
        f(&logcalls);
        logcalls.clear();
    }

    /// Captured records at `level` whose message contains `needle`.
    pub fn find(&self, level: Level, needle: &str) -> Vec<LogCall> {
        log_calls()
            .iter()
            .filter(|c| c.level == level && c.args.contains(needle))
            .cloned()
            .collect()
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(CAPTURED_TARGET_PREFIX) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        log_calls().push(LogCall {
            level: record.level(),
            args: format!("{}", record.args()),
            target: record.target().to_string(),
            line: record.line(),
            file: record.file().map(|file| file.to_string()),
            module_path: record
                .module_path()
                .map(|module_path| module_path.to_string()),
        });

        println!("Thread {:?} {:?}", current().id(), record);
    }

    fn flush(&self) {}
}
