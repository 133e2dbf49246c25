// Copyright 2024 Google LLC
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

//! POSIX message queues between the daemon, the executor, and the
//! stat collector.
//!
//! The daemon owns two queues: a write side it pushes fired jobs
//! into for the executor, and a read side the executor reports
//! execution results back on. Geometry (name, depth, message size)
//! comes from the bootstrap config.

use std::ffi::CString;

use anyhow::{anyhow, Context};
use nix::{
    errno::Errno,
    mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT},
    sys::stat::Mode,
};
use tracing::{info, warn};

pub struct MessageQueue {
    mqd: Option<MqdT>,
    name: String,
    msgsize: usize,
}

impl MessageQueue {
    /// Open (creating if needed) a queue for reading or writing.
    /// Both sides are opened non-blocking: a full exec queue drops
    /// the dispatch with an error rather than stalling a scheduler
    /// worker, and the stat side polls.
    pub fn open(name: &str, write: bool, msgmax: usize, msgsize: usize) -> anyhow::Result<Self> {
        if !name.starts_with('/') {
            return Err(anyhow!("queue name '{name}' must start with '/'"));
        }
        let cname = CString::new(name).context("queue name contains a NUL")?;

        let mut oflag = MQ_OFlag::O_CREAT | MQ_OFlag::O_NONBLOCK;
        oflag |= if write { MQ_OFlag::O_WRONLY } else { MQ_OFlag::O_RDONLY };

        let attr = MqAttr::new(
            0,
            msgmax as nix::mqueue::mq_attr_member_t,
            msgsize as nix::mqueue::mq_attr_member_t,
            0,
        );
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        let mqd = mq_open(cname.as_c_str(), oflag, mode, Some(&attr))
            .with_context(|| format!("opening message queue {name}"))?;
        info!("opened message queue {} ({} x {} bytes)", name, msgmax, msgsize);

        Ok(MessageQueue { mqd: Some(mqd), name: String::from(name), msgsize })
    }

    pub fn msgsize(&self) -> usize {
        self.msgsize
    }

    pub fn send(&self, msg: &[u8]) -> anyhow::Result<()> {
        if msg.len() > self.msgsize {
            return Err(anyhow!(
                "message of {} bytes exceeds the {} byte queue geometry",
                msg.len(),
                self.msgsize
            ));
        }
        let mqd = self.mqd.as_ref().expect("queue is open");
        mq_send(mqd, msg, 0).with_context(|| format!("sending on {}", self.name))?;
        Ok(())
    }

    /// Pull one message if one is ready. Returns None when the queue
    /// is empty.
    pub fn recv(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let mqd = self.mqd.as_ref().expect("queue is open");
        let mut buf = vec![0u8; self.msgsize];
        let mut prio = 0u32;
        match mq_receive(mqd, &mut buf, &mut prio) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("receiving on {}", self.name)),
        }
    }

    /// Remove the queue name from the system. Used on shutdown by
    /// whichever side owns the queue.
    pub fn unlink(name: &str) {
        if let Ok(cname) = CString::new(name) {
            if let Err(e) = mq_unlink(cname.as_c_str()) {
                if e != Errno::ENOENT {
                    warn!("unlinking queue {}: {}", name, e);
                }
            }
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            if let Err(e) = mq_close(mqd) {
                warn!("closing queue {}: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Queue names are global to the machine; pid-qualify them so
    // concurrent test runs stay hermetic.
    fn test_queue_name(tag: &str) -> String {
        format!("/usched-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn send_then_recv() {
        let name = test_queue_name("basic");
        let tx = MessageQueue::open(&name, true, 4, 128).expect("open write side");
        let rx = MessageQueue::open(&name, false, 4, 128).expect("open read side");

        tx.send(b"hello").expect("send");
        assert_eq!(rx.recv().expect("recv"), Some(b"hello".to_vec()));
        assert_eq!(rx.recv().expect("recv"), None);

        drop(tx);
        drop(rx);
        MessageQueue::unlink(&name);
    }

    #[test]
    fn oversized_messages_are_refused() {
        let name = test_queue_name("oversize");
        let tx = MessageQueue::open(&name, true, 4, 16).expect("open write side");
        assert!(tx.send(&[0u8; 17]).is_err());
        drop(tx);
        MessageQueue::unlink(&name);
    }

    #[test]
    fn relative_names_are_refused() {
        assert!(MessageQueue::open("not-absolute", true, 4, 16).is_err());
    }
}
