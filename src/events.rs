// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
};

/// A rendezvous between one producer and one consumer: the producer hands
/// over a value and blocks until the consumer reports completion.
///
/// Built from two zero-capacity channels so that both the handoff and the
/// acknowledgement are synchronous. One instance per pipeline hop, owned by
/// the engine, so multiple engines can coexist in one process.
pub(crate) struct Rendezvous<T> {
    req_tx: Sender<Option<T>>,
    req_rx: Receiver<Option<T>>,
    ack_tx: Sender<()>,
    ack_rx: Receiver<()>,
}

impl<T> Rendezvous<T> {
    pub(crate) fn new() -> Self {
        let (req_tx, req_rx) = bounded(0);
        let (ack_tx, ack_rx) = bounded(0);
        Rendezvous {
            req_tx,
            req_rx,
            ack_tx,
            ack_rx,
        }
    }

    /// Producer side: hand `value` to the consumer and block until it calls
    /// [`Rendezvous::done`].
    pub(crate) fn start_and_block_until_done(&self, value: T) {
        if self.req_tx.send(Some(value)).is_err() {
            return;
        }
        let _ = self.ack_rx.recv();
    }

    /// Consumer side: block for the next value. `None` means a shutdown
    /// wakeup; the consumer is expected to exit its loop.
    pub(crate) fn wait(&self) -> Option<T> {
        match self.req_rx.recv() {
            | Ok(value) => value,
            | Err(_) => None,
        }
    }

    /// Consumer side: unblock the producer of the value most recently
    /// returned by [`Rendezvous::wait`].
    pub(crate) fn done(&self) {
        let _ = self.ack_tx.send(());
    }

    /// Wake the consumer out of [`Rendezvous::wait`] without a value.
    /// Blocks until the consumer picks the wakeup up, so a consumer still
    /// finishing its previous round is not missed.
    pub(crate) fn notify_waiters(&self) {
        let _ = self.req_tx.send(None);
    }
}
