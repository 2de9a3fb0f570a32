#![allow(dead_code)]

//! In-process fabric harness: a sequencer polled on a background thread,
//! handing out loopback-connected clients.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError};

use lockstep::client::Client;
use lockstep::core::SeqNum;
use lockstep::server::Sequencer;
use lockstep::transport::LoopbackChannel;

pub fn seq(v: f64) -> SeqNum {
    SeqNum::new(v).unwrap()
}

pub struct Fabric {
    attach_tx: Sender<LoopbackChannel>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Fabric {
    pub fn start() -> Fabric {
        let (attach_tx, attach_rx) = crossbeam::channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || run_sequencer(attach_rx, thread_stop));
        Fabric {
            attach_tx,
            stop,
            handle: Some(handle),
        }
    }

    /// A fresh client endpoint, not yet started.
    pub fn connect(&self) -> Client<LoopbackChannel> {
        Client::new(self.connect_raw())
    }

    /// A bare byte channel into the fabric, for tests that speak the wire
    /// protocol directly.
    pub fn connect_raw(&self) -> LoopbackChannel {
        let (ours, theirs) = LoopbackChannel::pair();
        self.attach_tx.send(theirs).expect("sequencer thread gone");
        ours
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_sequencer(attach_rx: Receiver<LoopbackChannel>, stop: Arc<AtomicBool>) {
    let mut sequencer = Sequencer::new();
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let mut busy = false;
        loop {
            match attach_rx.try_recv() {
                Ok(channel) => {
                    sequencer.attach(channel);
                    busy = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
        busy |= sequencer.handle_io();
        if !busy {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
