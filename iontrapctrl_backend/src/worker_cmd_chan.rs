//! Command channel from a controlling thread to a running experiment loop.
//!
//! The loop never blocks on the channel while it is running: it polls with
//! [`CmdRecvr::try_recv`] at every iteration boundary and only waits (with a timeout) while it
//! is paused. Only the latest command is kept; `Stop` is final and is never overwritten.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCmd {
    Pause,
    Resume,
    Stop,
}

#[derive(Clone)]
pub struct CmdChan {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>, // (msg_num: usize, worker_cmd: WorkerCmd)
    condvar: Arc<Condvar>,
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, WorkerCmd::Resume))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr {
        // A receiver only reacts to messages posted after its creation
        let (msg_num, _cmd_val) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }

    pub fn send(&self, cmd: WorkerCmd) {
        let mut mutex_guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *mutex_guard;
        if *msg_num > 0 && *cmd_val == WorkerCmd::Stop {
            return;
        }
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    /// Returns the latest unseen command without blocking
    pub fn try_recv(&mut self) -> Option<WorkerCmd> {
        let (msg_num, cmd_val) = *self.cmd.lock();
        self.take(msg_num, cmd_val)
    }

    /// Waits up to `timeout` for a new command
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<WorkerCmd> {
        let mut mutex_guard = self.cmd.lock();
        if mutex_guard.0 == self.viewed_msg_num {
            self.condvar.wait_for(&mut mutex_guard, timeout);
        }
        let (msg_num, cmd_val) = *mutex_guard;
        drop(mutex_guard);
        self.take(msg_num, cmd_val)
    }

    fn take(&mut self, msg_num: usize, cmd_val: WorkerCmd) -> Option<WorkerCmd> {
        if msg_num == self.viewed_msg_num {
            return None;
        }
        self.viewed_msg_num = msg_num;
        Some(cmd_val)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn receiver_sees_only_new_commands() {
        let chan = CmdChan::new();
        chan.send(WorkerCmd::Pause);
        let mut recvr = chan.new_recvr();
        assert_eq!(recvr.try_recv(), None);
        chan.send(WorkerCmd::Resume);
        assert_eq!(recvr.try_recv(), Some(WorkerCmd::Resume));
        assert_eq!(recvr.try_recv(), None);
    }

    #[test]
    fn latest_command_wins_and_stop_is_final() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        chan.send(WorkerCmd::Pause);
        chan.send(WorkerCmd::Stop);
        chan.send(WorkerCmd::Resume);
        assert_eq!(recvr.try_recv(), Some(WorkerCmd::Stop));
    }

    #[test]
    fn recv_timeout_wakes_on_send() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        assert_eq!(recvr.recv_timeout(Duration::from_millis(5)), None);

        let sender = chan.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.send(WorkerCmd::Resume);
        });
        let mut received = None;
        for _ in 0..100 {
            received = recvr.recv_timeout(Duration::from_millis(50));
            if received.is_some() {
                break;
            }
        }
        worker.join().unwrap();
        assert_eq!(received, Some(WorkerCmd::Resume));
    }
}
