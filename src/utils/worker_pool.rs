//! Region-parallel worker pool with ordered emission.
//!
//! Workers pull region tasks from a shared channel and push finished
//! outputs tagged with their task index; a single postprocessor thread
//! restores task order before writing, so records always come out in the
//! configured region order regardless of worker scheduling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::thread::scope;

pub trait Orderable {
    fn index(&self) -> usize;
}

/// Cooperative cancellation: workers finish their current region and stop.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub fn worker_pool<U, T, W, P>(
    workers: Vec<W>,
    in_receiver: Receiver<U>,
    out_capacity: usize,
    mut postprocessor: P,
) -> Result<()>
where
    U: Send,
    T: Orderable + Send,
    W: FnOnce(Receiver<U>, Sender<T>) -> Result<()> + Send,
    P: FnMut(T) -> Result<()> + Send,
{
    scope(|scope| -> Result<()> {
        let (out_sender, out_receiver) = bounded::<T>(out_capacity);
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| {
                let receiver = in_receiver.clone();
                let sender = out_sender.clone();
                scope.spawn(move |_| worker(receiver, sender))
            })
            .collect();
        drop(out_sender);
        let postprocessor = scope.spawn(move |_| -> Result<()> {
            let mut pending: BTreeMap<usize, T> = BTreeMap::new();
            let mut next_index = 0usize;
            for item in out_receiver {
                pending.insert(item.index(), item);
                while let Some(item) = pending.remove(&next_index) {
                    postprocessor(item)?;
                    next_index += 1;
                }
            }
            // a cancelled run may leave gaps; flush what completed, in order
            for (_, item) in pending {
                postprocessor(item)?;
            }
            Ok(())
        });
        for handle in handles {
            handle.join().expect("worker thread panicked")?;
        }
        postprocessor.join().expect("postprocessor thread panicked")?;
        Ok(())
    })
    .expect("worker pool scope panicked")
}
