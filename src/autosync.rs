//! 自動同期スレッド.
//!
//! `JournaledFile::autosync`によって起動され、一定間隔ごと、
//! ないしコミットされたバイト数が閾値に達するごとに`JournaledFile::sync`相当の処理を実行する.
//!
//! スレッドはファイルへの弱参照のみを保持し、ファイルが解放されると終了する.
use slog::Logger;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::file::SharedFile;
use crate::metrics::AutoSyncMetrics;
use crate::{ErrorKind, Result};

/// 自動同期スレッドへのハンドル.
///
/// ドロップ時にはスレッドを停止し、その終了を待機する.
#[derive(Debug)]
pub struct AutoSync {
    command_tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    interval: Duration,
    max_dirty_bytes: u64,
}
impl AutoSync {
    pub(crate) fn start(
        file: Weak<SharedFile>,
        interval: Duration,
        max_dirty_bytes: u64,
        logger: Logger,
        metrics: AutoSyncMetrics,
    ) -> Result<Self> {
        track_assert_ne!(interval, Duration::from_secs(0), ErrorKind::InvalidInput);

        let (command_tx, command_rx) = mpsc::channel();
        let mut runner = AutoSyncThread {
            file,
            command_rx,
            interval,
            max_dirty_bytes,
            dirty_bytes: 0,
            deadline: Instant::now() + interval,
            logger,
            metrics,
        };
        let thread = track_io!(thread::Builder::new()
            .name("cannyjio_autosync".to_owned())
            .spawn(move || runner.run()))?;
        Ok(AutoSync {
            command_tx,
            thread: Some(thread),
            interval,
            max_dirty_bytes,
        })
    }

    /// 同期間隔を返す.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 同期を前倒しするバイト数の閾値を返す.
    ///
    /// `0`の場合には、間隔による同期のみが行われる.
    pub fn max_dirty_bytes(&self) -> u64 {
        self.max_dirty_bytes
    }

    pub(crate) fn notify_dirty(&self, bytes: u64) {
        let _ = self.command_tx.send(Command::Dirty(bytes));
    }

    /// スレッドを停止し、その終了を待機する.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.command_tx.send(Command::Stop);
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
impl Drop for AutoSync {
    fn drop(&mut self) {
        self.join();
    }
}

#[derive(Debug)]
enum Command {
    Dirty(u64),
    Stop,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Interval,
    DirtyBytes,
}

struct AutoSyncThread {
    file: Weak<SharedFile>,
    command_rx: Receiver<Command>,
    interval: Duration,
    max_dirty_bytes: u64,
    dirty_bytes: u64,
    deadline: Instant,
    logger: Logger,
    metrics: AutoSyncMetrics,
}
impl AutoSyncThread {
    fn run(&mut self) {
        info!(self.logger, "Autosync thread started";
              "interval_ms" => self.interval.as_millis() as u64,
              "max_dirty_bytes" => self.max_dirty_bytes);
        loop {
            let now = Instant::now();
            let timeout = if self.deadline > now {
                self.deadline - now
            } else {
                Duration::from_secs(0)
            };
            let keep_running = match self.command_rx.recv_timeout(timeout) {
                Ok(Command::Dirty(bytes)) => {
                    self.dirty_bytes += bytes;
                    if self.max_dirty_bytes != 0 && self.dirty_bytes >= self.max_dirty_bytes {
                        self.sync(Trigger::DirtyBytes)
                    } else {
                        true
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.sync(Trigger::Interval),
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => false,
            };
            if !keep_running {
                break;
            }
        }
        info!(self.logger, "Autosync thread stopped");
    }

    fn sync(&mut self, trigger: Trigger) -> bool {
        let file = match self.file.upgrade() {
            Some(file) => file,
            None => return false,
        };
        match track!(file.sync()) {
            Ok(()) => match trigger {
                Trigger::Interval => self.metrics.syncs_by_interval.increment(),
                Trigger::DirtyBytes => self.metrics.syncs_by_dirty_bytes.increment(),
            },
            Err(e) => {
                self.metrics.failed_syncs.increment();
                warn!(self.logger, "Autosync failed"; "error" => e.to_string());
            }
        }
        self.dirty_bytes = 0;
        self.deadline = Instant::now() + self.interval;
        true
    }
}
