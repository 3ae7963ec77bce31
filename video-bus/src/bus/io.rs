use std::thread::{self, ThreadId};

type Task = Box<dyn FnOnce() + Send>;

enum IoMsg {
    Task(Task),
    Stop,
}

/// The single I/O event thread. Created on the thread that will later call
/// [`IoLoop::run`]; everything the bus client does happens there, and other
/// threads reach it by posting closures through an [`IoHandle`].
pub struct IoLoop {
    rx: crossbeam_channel::Receiver<IoMsg>,
    handle: IoHandle,
}

#[derive(Clone)]
pub struct IoHandle {
    tx: crossbeam_channel::Sender<IoMsg>,
    thread_id: ThreadId,
}

impl IoLoop {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            rx,
            handle: IoHandle {
                tx,
                thread_id: thread::current().id(),
            },
        }
    }

    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    /// Processes posted tasks until [`IoHandle::stop`] is called. Must run on
    /// the thread the loop was created on.
    pub fn run(&self) -> usize {
        assert_eq!(
            thread::current().id(),
            self.handle.thread_id,
            "io loop must run on its creating thread"
        );
        let mut executed = 0;
        while let Ok(msg) = self.rx.recv() {
            match msg {
                IoMsg::Task(task) => {
                    task();
                    executed += 1;
                }
                IoMsg::Stop => break,
            }
        }
        executed
    }
}

impl Default for IoLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl IoHandle {
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(IoMsg::Task(Box::new(task))).is_err() {
            log::warn!("io loop is gone, dropping posted task");
        }
    }

    pub fn is_io_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Makes [`IoLoop::run`] return after the tasks posted so far.
    pub fn stop(&self) {
        let _ = self.tx.send(IoMsg::Stop);
    }
}
