//! Bounded blocking hand-off between producer threads and one consumer.
//!
//! Producers `offer` whole batches and block while `max_ready` batches are
//! queued. The consumer assembles output batches under `BatchLimits`. The
//! first `end` wins; later ones are no-ops. Ending wakes everybody: producers
//! see their `offer` fail, the consumer drains what is buffered and then sees
//! the end result.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use fedq_core::{Batch, BatchType, Error, Result, Vars};

use crate::bit::{BIt, BatchLimits, Interrupt, Terminal};

struct QueueState<B> {
    ready: VecDeque<B>,
    ended: Option<Result<()>>,
    producers: usize,
}

pub struct BatchQueue<B: Batch> {
    state: Mutex<QueueState<B>>,
    has_ready: Condvar,
    has_space: Condvar,
    stopped: Condvar,
    max_ready: usize,
}

impl<B: Batch> BatchQueue<B> {
    /// Queue fed by `producers` producers, each of which must call
    /// `producer_done` exactly once.
    pub fn new(max_ready: usize, producers: usize) -> Self {
        let ended = (producers == 0).then_some(Ok(()));
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::with_capacity(max_ready.max(1)),
                ended,
                producers,
            }),
            has_ready: Condvar::new(),
            has_space: Condvar::new(),
            stopped: Condvar::new(),
            max_ready: max_ready.max(1),
        }
    }

    pub fn max_ready(&self) -> usize {
        self.max_ready
    }

    /// Enqueue `batch`, blocking while the queue is full. Fails once the
    /// queue ended; the batch is dropped in that case.
    pub fn offer(&self, batch: B) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            match &st.ended {
                Some(Err(e)) => return Err(e.clone()),
                Some(Ok(())) => return Err(Error::protocol("offer to a completed queue")),
                None => {}
            }
            if st.ready.len() < self.max_ready {
                break;
            }
            self.has_space.wait(&mut st);
        }
        if !batch.is_empty() {
            st.ready.push_back(batch);
            self.has_ready.notify_one();
        }
        Ok(())
    }

    /// End the queue with `result` unless it already ended. Returns true when
    /// this call decided the outcome.
    pub fn end(&self, result: Result<()>) -> bool {
        let mut st = self.state.lock();
        let first = st.ended.is_none();
        if first {
            st.ended = Some(result);
        }
        drop(st);
        self.wake_all();
        first
    }

    /// One producer finished. An error ends the queue (first error wins);
    /// the last clean finish ends it as exhausted.
    pub fn producer_done(&self, result: Result<()>) {
        let mut st = self.state.lock();
        st.producers = st.producers.saturating_sub(1);
        if st.ended.is_none() {
            match result {
                Err(e) => st.ended = Some(Err(e)),
                Ok(()) if st.producers == 0 => st.ended = Some(Ok(())),
                Ok(()) => {}
            }
        }
        drop(st);
        self.wake_all();
    }

    /// Block until every producer called `producer_done`.
    pub fn wait_stopped(&self) {
        let mut st = self.state.lock();
        while st.producers > 0 {
            self.stopped.wait(&mut st);
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended.is_some()
    }

    /// Remove every buffered batch.
    pub fn drain_ready(&self) -> Vec<B> {
        let drained: Vec<B> = self.state.lock().ready.drain(..).collect();
        self.has_space.notify_all();
        drained
    }

    /// Assemble the next output batch. `Ok(None)` once the queue ended
    /// cleanly and nothing is buffered; the end error once it failed and
    /// nothing is buffered.
    pub fn take(&self, limits: &BatchLimits) -> Result<Option<B>> {
        let start = Instant::now();
        let min_deadline = start + limits.min_wait;
        let max_deadline = start + limits.max_wait;
        let mut acc: Option<B> = None;
        let mut st = self.state.lock();
        loop {
            if fill(&mut acc, &mut st.ready, limits.max_batch) {
                self.has_space.notify_all();
            }
            let rows = acc.as_ref().map_or(0, Batch::rows);

            if st.ready.is_empty() {
                match &st.ended {
                    Some(_) if rows > 0 => return Ok(acc),
                    Some(Ok(())) => return Ok(None),
                    Some(Err(e)) => return Err(e.clone()),
                    None => {}
                }
            }
            if rows >= limits.max_batch {
                return Ok(acc);
            }
            let now = Instant::now();
            if rows >= limits.min_batch && now >= min_deadline {
                return Ok(acc);
            }
            if rows > 0 && now >= max_deadline {
                return Ok(acc);
            }

            let deadline = if rows >= limits.min_batch {
                Some(min_deadline)
            } else if rows > 0 {
                Some(max_deadline)
            } else {
                None
            };
            match deadline {
                Some(d) => {
                    self.has_ready.wait_until(&mut st, d);
                }
                None => self.has_ready.wait(&mut st),
            }
        }
    }

    fn wake_all(&self) {
        self.has_ready.notify_all();
        self.has_space.notify_all();
        self.stopped.notify_all();
    }
}

impl<B: Batch> Interrupt for BatchQueue<B> {
    fn interrupt(&self) {
        self.end(Err(Error::Cancelled));
    }
}

/// Move queued batches into `acc` until it holds `max_rows` rows. Rows past
/// the bound go back to the front of the queue. Returns true when a batch
/// was dequeued.
pub(crate) fn fill<B: Batch>(acc: &mut Option<B>, ready: &mut VecDeque<B>, max_rows: usize) -> bool {
    let mut moved = false;
    while acc.as_ref().map_or(0, Batch::rows) < max_rows {
        let Some(next) = ready.pop_front() else {
            break;
        };
        moved = true;
        match acc.as_mut() {
            Some(held) => held.append(next),
            None => *acc = Some(next),
        }
        if let Some(held) = acc.as_mut() {
            if held.rows() > max_rows {
                ready.push_front(held.split_off(max_rows));
            }
        }
    }
    moved
}

/// Producer half of a single-producer queue.
pub struct QueueSender<B: Batch> {
    queue: Arc<BatchQueue<B>>,
    done: bool,
}

impl<B: Batch> QueueSender<B> {
    pub fn offer(&self, batch: B) -> Result<()> {
        self.queue.offer(batch)
    }

    /// Terminate the stream: exhaustion for `None`, failure otherwise.
    pub fn complete(&mut self, error: Option<Error>) {
        if !std::mem::replace(&mut self.done, true) {
            self.queue.producer_done(error.map_or(Ok(()), Err));
        }
    }

    /// True once the consumer side ended the queue.
    pub fn is_closed(&self) -> bool {
        self.queue.is_ended()
    }
}

impl<B: Batch> Drop for QueueSender<B> {
    fn drop(&mut self) {
        self.complete(Some(Error::Invariant(
            "queue producer dropped without completing".into(),
        )));
    }
}

/// Consumer half of a single-producer queue.
pub struct QueueBIt<T: BatchType> {
    ty: T,
    vars: Vars,
    limits: BatchLimits,
    queue: Arc<BatchQueue<T::Batch>>,
    terminal: Terminal,
}

/// A bounded hand-off holding at most `capacity` batches.
pub fn queue_bit<T: BatchType>(
    ty: T,
    vars: Vars,
    capacity: usize,
) -> (QueueSender<T::Batch>, QueueBIt<T>) {
    let queue = Arc::new(BatchQueue::new(capacity, 1));
    let sender = QueueSender {
        queue: Arc::clone(&queue),
        done: false,
    };
    let bit = QueueBIt {
        ty,
        vars,
        limits: BatchLimits::default(),
        queue,
        terminal: Terminal::default(),
    };
    (sender, bit)
}

impl<T: BatchType> BIt<T::Batch> for QueueBIt<T> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        Ok(())
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(r) = recycled {
            self.ty.recycle(r);
        }
        if let Some(done) = self.terminal.check() {
            return done;
        }
        match self.queue.take(&self.limits) {
            Ok(Some(b)) => Ok(Some(b)),
            Ok(None) => {
                self.terminal.exhaust();
                Ok(None)
            }
            Err(e) => Err(self.terminal.fail(e)),
        }
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        self.ty.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        let queue: Arc<dyn Interrupt> = self.queue.clone();
        Some(queue)
    }

    fn close(&mut self) -> Result<()> {
        if self.terminal.close() {
            self.queue.end(Err(Error::Cancelled));
            for b in self.queue.drain_ready() {
                self.ty.recycle(b);
            }
        }
        Ok(())
    }
}

impl<T: BatchType> Drop for QueueBIt<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use fedq_core::term::int;
    use fedq_core::TermBatch;
    use fedq_mem::TermBatchType;

    fn rows(values: std::ops::Range<i64>) -> TermBatch {
        TermBatch::of_rows(1, values.map(|i| vec![Some(int(i))]))
    }

    fn limits(min: usize, max: usize, max_wait_ms: u64) -> BatchLimits {
        BatchLimits {
            min_batch: min,
            max_batch: max,
            min_wait: Duration::ZERO,
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    #[test]
    fn take_splits_at_max_batch() {
        let q = BatchQueue::new(4, 1);
        q.offer(rows(0..5)).unwrap();
        q.producer_done(Ok(()));
        let l = limits(1, 2, 0);
        assert_eq!(q.take(&l).unwrap().unwrap().rows(), 2);
        assert_eq!(q.take(&l).unwrap().unwrap().rows(), 2);
        assert_eq!(q.take(&l).unwrap().unwrap().rows(), 1);
        assert!(q.take(&l).unwrap().is_none());
        assert!(q.take(&l).unwrap().is_none());
    }

    #[test]
    fn take_returns_undersized_after_max_wait() {
        let q = BatchQueue::new(4, 1);
        q.offer(rows(0..1)).unwrap();
        let started = Instant::now();
        let b = q.take(&limits(10, 100, 20)).unwrap().unwrap();
        assert_eq!(b.rows(), 1);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn buffered_batches_come_before_the_error() {
        let q = BatchQueue::new(4, 1);
        q.offer(rows(0..3)).unwrap();
        q.producer_done(Err(Error::upstream("boom")));
        let l = limits(1, 100, 0);
        assert_eq!(q.take(&l).unwrap().unwrap().rows(), 3);
        assert!(matches!(q.take(&l), Err(Error::Source(_))));
        assert!(matches!(q.take(&l), Err(Error::Source(_))));
    }

    #[test]
    fn full_queue_blocks_until_interrupted() {
        let q = Arc::new(BatchQueue::new(1, 1));
        q.offer(rows(0..1)).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.offer(rows(1..2)))
        };
        thread::sleep(Duration::from_millis(20));
        q.interrupt();
        let res = producer.join().unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn first_end_wins_and_wait_stopped_returns() {
        let q: BatchQueue<TermBatch> = BatchQueue::new(1, 2);
        q.producer_done(Err(Error::upstream("first")));
        q.producer_done(Err(Error::upstream("second")));
        assert!(!q.end(Err(Error::Cancelled)));
        q.wait_stopped();
        match q.take(&limits(1, 1, 0)) {
            Err(Error::Source(m)) => assert_eq!(m, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn queue_bit_close_fails_the_producer() {
        let ty = TermBatchType::new(4, usize::MAX);
        let (sender, mut bit) = queue_bit(ty, fedq_core::Vars::of(["x"]), 1);
        sender.offer(rows(0..1)).unwrap();
        bit.close().unwrap();
        assert!(sender.is_closed());
        assert!(matches!(sender.offer(rows(1..2)), Err(Error::Cancelled)));
        assert!(matches!(bit.next_batch(None), Err(Error::Cancelled)));
    }
}
